//! UniFFI bindings for mobile platforms.
//!
//! The app holds one [`FfiRunStore`] per process. Records cross the boundary
//! as flat `Ffi*` records and are converted here.

use std::sync::Arc;

use log::info;

use crate::config::{RemoteConfig, SyncConfig};
use crate::controller::{SyncController, SyncPhase};
use crate::error::PersistenceError;
use crate::model::{AggregateRecord, RoutePoint, RunId, RunRecord, RunTelemetry, UserToken};
use crate::session::SharedToken;
use crate::store::{LocalStore, RemoteStore};

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, uniffi::Record)]
pub struct FfiRoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elapsed_ms: u64,
}

impl From<RoutePoint> for FfiRoutePoint {
    fn from(p: RoutePoint) -> Self {
        Self {
            latitude: p.latitude,
            longitude: p.longitude,
            elapsed_ms: p.elapsed_ms,
        }
    }
}

impl From<FfiRoutePoint> for RoutePoint {
    fn from(p: FfiRoutePoint) -> Self {
        RoutePoint::new(p.latitude, p.longitude, p.elapsed_ms)
    }
}

/// Run record for FFI. `id` is the start time in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiRunRecord {
    pub id: i64,
    pub duration_s: f64,
    pub distance_m: f64,
    pub calories: f64,
    pub average_heart_rate: Option<u32>,
    pub route: Vec<FfiRoutePoint>,
    pub discarded: bool,
}

impl From<RunRecord> for FfiRunRecord {
    fn from(r: RunRecord) -> Self {
        let t = r.telemetry;
        Self {
            id: r.id.0,
            duration_s: t.duration_s,
            distance_m: t.distance_m,
            calories: t.calories,
            average_heart_rate: t.average_heart_rate,
            route: t.route.into_iter().map(FfiRoutePoint::from).collect(),
            discarded: t.discarded,
        }
    }
}

impl From<FfiRunRecord> for RunRecord {
    fn from(r: FfiRunRecord) -> Self {
        RunRecord::new(
            RunId(r.id),
            RunTelemetry {
                duration_s: r.duration_s,
                distance_m: r.distance_m,
                calories: r.calories,
                average_heart_rate: r.average_heart_rate,
                route: r.route.into_iter().map(RoutePoint::from).collect(),
                discarded: r.discarded,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiAggregateRecord {
    pub number_of_runs: u32,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub total_calories: f64,
    pub longest_run_m: f64,
}

impl From<AggregateRecord> for FfiAggregateRecord {
    fn from(a: AggregateRecord) -> Self {
        Self {
            number_of_runs: a.number_of_runs,
            total_distance_m: a.total_distance_m,
            total_duration_s: a.total_duration_s,
            total_calories: a.total_calories,
            longest_run_m: a.longest_run_m,
        }
    }
}

impl From<FfiAggregateRecord> for AggregateRecord {
    fn from(a: FfiAggregateRecord) -> Self {
        Self {
            number_of_runs: a.number_of_runs,
            total_distance_m: a.total_distance_m,
            total_duration_s: a.total_duration_s,
            total_calories: a.total_calories,
            longest_run_m: a.longest_run_m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSyncPhase {
    Idle,
    SyncScheduled,
    Syncing,
}

impl From<SyncPhase> for FfiSyncPhase {
    fn from(p: SyncPhase) -> Self {
        match p {
            SyncPhase::Idle => Self::Idle,
            SyncPhase::SyncScheduled => Self::SyncScheduled,
            SyncPhase::Syncing => Self::Syncing,
        }
    }
}

/// Flattened [`SyncConfig`] for FFI.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct FfiSyncConfig {
    pub db_path: String,
    pub retry_interval_ms: u64,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl From<SyncConfig> for FfiSyncConfig {
    fn from(c: SyncConfig) -> Self {
        Self {
            db_path: c.db_path,
            retry_interval_ms: c.retry_interval_ms,
            base_url: c.remote.base_url,
            request_timeout_secs: c.remote.request_timeout_secs,
            max_retries: c.remote.max_retries,
        }
    }
}

impl From<FfiSyncConfig> for SyncConfig {
    fn from(c: FfiSyncConfig) -> Self {
        Self {
            db_path: c.db_path,
            retry_interval_ms: c.retry_interval_ms,
            remote: RemoteConfig {
                base_url: c.base_url,
                request_timeout_secs: c.request_timeout_secs,
                max_retries: c.max_retries,
            },
        }
    }
}

/// Default configuration with the database at `db_path`.
#[uniffi::export]
pub fn default_sync_config(db_path: String) -> FfiSyncConfig {
    SyncConfig {
        db_path,
        ..Default::default()
    }
    .into()
}

// ============================================================================
// Store handle
// ============================================================================

/// Persistence handle exposed to the app.
#[derive(uniffi::Object)]
pub struct FfiRunStore {
    controller: SyncController<LocalStore, RemoteStore>,
    tokens: SharedToken,
}

#[uniffi::export]
impl FfiRunStore {
    /// Open the local database and start the sync worker.
    #[uniffi::constructor]
    pub fn new(config: FfiSyncConfig, user_token: String) -> Result<Arc<Self>, PersistenceError> {
        crate::init_logging();

        let config = SyncConfig::from(config);
        config.validate()?;
        let token = UserToken::new(user_token);
        let local = LocalStore::open(&config.db_path, token.clone())?;
        let remote = RemoteStore::new(&config.remote, token.clone())?;
        let tokens = SharedToken::new(token);

        let controller = SyncController::new(
            local,
            remote,
            Arc::new(tokens.clone()),
            config.retry_interval(),
        )?;
        info!("[FFI] Run store opened at {}", config.db_path);
        Ok(Arc::new(Self { controller, tokens }))
    }

    /// Returns the edit time the run was stored with.
    pub fn store_run(&self, record: FfiRunRecord) -> Result<i64, PersistenceError> {
        self.controller
            .save_run(&record.into())
            .map(|t| t.millis())
    }

    pub fn delete_run(&self, record: FfiRunRecord) -> Result<(), PersistenceError> {
        self.controller.delete_run(&record.into())
    }

    /// Runs newest first.
    pub fn load_runs(&self) -> Result<Vec<FfiRunRecord>, PersistenceError> {
        Ok(self
            .controller
            .load_runs()?
            .into_iter()
            .map(FfiRunRecord::from)
            .collect())
    }

    pub fn store_aggregate(&self, record: FfiAggregateRecord) -> Result<i64, PersistenceError> {
        self.controller
            .save_aggregate(&record.into())
            .map(|t| t.millis())
    }

    pub fn delete_aggregate(&self) -> Result<(), PersistenceError> {
        self.controller.delete_aggregate()
    }

    pub fn load_aggregate(&self) -> Result<FfiAggregateRecord, PersistenceError> {
        self.controller.load_aggregate().map(FfiAggregateRecord::from)
    }

    pub fn sync_now(&self) {
        self.controller.request_sync();
    }

    /// Switch the signed-in user. The next operation and pass use the new
    /// namespace.
    pub fn set_user_token(&self, user_token: String) {
        self.tokens.rotate(UserToken::new(user_token));
        self.controller.request_sync();
    }

    pub fn sync_phase(&self) -> FfiSyncPhase {
        self.controller.phase().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_record_conversion_keeps_route() {
        let record = FfiRunRecord {
            id: 1_700_000_000_000,
            duration_s: 1800.0,
            distance_m: 5000.0,
            calories: 320.0,
            average_heart_rate: Some(151),
            route: vec![FfiRoutePoint {
                latitude: 52.37,
                longitude: 4.89,
                elapsed_ms: 0,
            }],
            discarded: false,
        };
        let native: RunRecord = record.clone().into();
        assert_eq!(native.id, RunId(1_700_000_000_000));
        assert_eq!(native.telemetry.route.len(), 1);
        assert_eq!(FfiRunRecord::from(native), record);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = default_sync_config("unused.db".to_string());
        config.retry_interval_ms = 0;
        let result = FfiRunStore::new(config, "u".to_string());
        assert!(matches!(result, Err(PersistenceError::Config { .. })));
    }
}
