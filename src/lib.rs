//! # RunSync
//!
//! Offline-first persistence for a run-tracking app: run records and a per-user
//! aggregate are written to an on-device store first and reconciled with a
//! remote store in the background.
//!
//! This library provides:
//! - A storage contract shared by the SQLite local store and the HTTP remote store
//! - Tombstones ("ghosts") so deletions made offline propagate instead of
//!   being resurrected by stale copies
//! - A stateless reconciliation pass (last-writer-wins on edit time)
//! - A single-worker sync controller with fixed-interval retry
//!
//! ## Features
//!
//! - **`ffi`** - Enable UniFFI bindings for mobile platforms (iOS/Android)
//!
//! ## Quick Start
//!
//! ```rust
//! use runsync::{synchronize, MemoryStore, RemoteSession, RunId, RunRecord, RunTelemetry,
//!               StorageComponent, UserToken};
//!
//! let token = UserToken::new("user-token");
//! let mut local = MemoryStore::new(token.clone());
//! let mut remote = MemoryStore::remote(token);
//!
//! local.save_record(&RunRecord::new(RunId(1000), RunTelemetry::default()), None).unwrap();
//!
//! remote.connect().unwrap();
//! let report = synchronize(&mut local, &mut remote).unwrap();
//! assert_eq!(report.uploaded, 1);
//! ```

use std::time::Instant;

pub mod error;
pub use error::{PersistenceError, Result};

pub mod model;
pub use model::{
    AggregateRecord, EditClock, EditTime, RecordState, RoutePoint, RunId, RunRecord,
    RunTelemetry, UserToken,
};

pub mod config;
pub use config::{RemoteConfig, SyncConfig};

pub mod session;
pub use session::{SharedToken, TokenProvider};

// Local, remote and in-memory stores behind one contract
pub mod store;
pub use store::{LocalStore, MemoryStore, RemoteSession, RemoteStore, StorageComponent};

// Reconciliation algorithm
pub mod sync;
pub use sync::{plan, synchronize, AggregateOutcome, RunAction, SyncReport};

// Scheduling and retry
pub mod controller;
pub use controller::{SyncController, SyncPhase, SyncStats};

// Request/response boundary towards the message bus
pub mod facade;
pub use facade::{
    FacadeHandle, PersistenceFacade, PersistenceRequest, PersistenceResponse, ResponseSink,
};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Helper to calculate elapsed milliseconds from an Instant
#[inline]
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("runsync"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}
