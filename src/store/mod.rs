//! # Storage Components
//!
//! One capability contract, [`StorageComponent`], implemented by the
//! on-device [`LocalStore`], the networked [`RemoteStore`], and the in-memory
//! [`MemoryStore`] used in tests. The synchronizer is written against the
//! trait only.
//!
//! Every mutating operation is durable before it returns `Ok`: callers use
//! that to decide whether a dependent call may proceed.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{AggregateRecord, EditTime, RecordState, RunId, RunRecord, UserToken};

pub mod local;
pub mod memory;
pub mod migrations;
pub mod remote;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Uniform contract shared by every store.
///
/// All operations act on the namespace of the currently bound user token;
/// records belonging to other tokens are never visible.
pub trait StorageComponent: Send {
    /// Bind the store to a user namespace. Subsequent operations only see
    /// that user's records.
    fn bind_user(&mut self, token: &UserToken);

    /// Ids of live run records.
    fn list_real_ids(&self) -> Result<BTreeSet<RunId>>;

    /// Ids carrying a tombstone.
    fn list_ghost_ids(&self) -> Result<BTreeSet<RunId>>;

    /// Fetch a run record. `Ok(None)` when absent, `CorruptData` when the
    /// stored bytes do not decode.
    fn get_record(&self, id: RunId) -> Result<Option<RunRecord>>;

    /// Write (or overwrite) a run record and return the edit time it was
    /// stored with. `None` stamps the store's own "now"; `Some(t)` keeps `t`,
    /// which is how a record copied from the other store keeps its ordering.
    fn save_record(
        &mut self,
        record: &RunRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime>;

    /// Edit time of a live record, [`EditTime::ABSENT`] if there is none.
    fn get_edit_time(&self, id: RunId) -> Result<EditTime>;

    /// Remove a live record. Does not create a tombstone.
    fn delete_record(&mut self, id: RunId) -> Result<()>;

    fn save_ghost(&mut self, id: RunId) -> Result<()>;

    fn delete_ghost(&mut self, id: RunId) -> Result<()>;

    fn get_aggregate(&self) -> Result<Option<AggregateRecord>>;

    /// Edit time of the aggregate, [`EditTime::ABSENT`] if there is none.
    fn get_aggregate_edit_time(&self) -> Result<EditTime>;

    /// Same edit-time rules as [`StorageComponent::save_record`].
    fn save_aggregate(
        &mut self,
        record: &AggregateRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime>;

    /// "Deleting" the aggregate stores the zeroed record: consumers always
    /// expect one to exist.
    fn delete_aggregate(&mut self) -> Result<()> {
        self.save_aggregate(&AggregateRecord::default(), None)?;
        Ok(())
    }

    /// Every live run record, newest first by start time.
    fn load_runs_newest_first(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for id in self.list_real_ids()?.into_iter().rev() {
            if let Some(record) = self.get_record(id)? {
                runs.push(record);
            }
        }
        Ok(runs)
    }

    /// Presence of `id` on this store.
    ///
    /// A ghost wins over a live record so an interrupted delete (tombstone
    /// written, record not yet removed) still reads as deleted.
    fn record_state(&self, id: RunId) -> Result<RecordState> {
        if self.list_ghost_ids()?.contains(&id) {
            return Ok(RecordState::Ghost);
        }
        let edit_time = self.get_edit_time(id)?;
        if edit_time.is_absent() {
            Ok(RecordState::Absent)
        } else {
            Ok(RecordState::Real(edit_time))
        }
    }
}

/// Session semantics of a store reached over the network.
///
/// A session is opened and closed exactly once per synchronization pass.
pub trait RemoteSession {
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}
