//! # Synchronizer
//!
//! Stateless reconciliation of two [`StorageComponent`]s.
//!
//! A pass reconciles the aggregate record first, then every run id that is
//! real or ghost on either side. Any failure aborts the pass immediately
//! (fail-fast, no partial commit of the remaining ids); the caller decides
//! whether to retry.
//!
//! ## Run-record table
//!
//! | local \ remote | absent        | real                 | ghost              |
//! |----------------|---------------|----------------------|--------------------|
//! | absent         | -             | download             | -                  |
//! | real           | upload        | newer edit time wins | delete local real  |
//! | ghost          | delete ghost  | delete on remote     | delete local ghost |
//!
//! A ghost is never overwritten by a real record from the other side: that
//! is what stops an offline delete from being resurrected by a stale copy.
//! "Delete on remote" writes the remote ghost and removes the remote record
//! but leaves the local ghost; the following pass sees ghost/ghost and clears
//! it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::{debug, info, warn};

use crate::elapsed_ms;
use crate::error::{PersistenceError, Result};
use crate::model::{AggregateRecord, EditTime, RecordState, RunId};
use crate::store::StorageComponent;

/// What one pass did to the aggregate record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Edit times matched
    #[default]
    Unchanged,
    /// Remote copy was newer and was written locally
    Downloaded,
    /// Local copy was newer and replaced the remote one
    Uploaded,
}

/// Action taken for a single run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunAction {
    Noop,
    /// Copy the remote record to local, keeping its edit time
    Download,
    /// Copy the local record to remote, keeping its edit time
    Upload,
    /// Remote gets a ghost and loses its record; local is left as is
    PropagateDeleteToRemote,
    /// Remote ghost is authoritative: remove the local record
    DeleteLocalReal,
    /// Nothing left to reconcile against: drop the local ghost
    DeleteLocalGhost,
}

/// Decide what to do with one id given its presence on each side.
pub fn plan(local: RecordState, remote: RecordState) -> RunAction {
    use RecordState::*;

    match (local, remote) {
        (Absent, Absent) => RunAction::Noop,
        (Absent, Real(_)) => RunAction::Download,
        (Absent, Ghost) => RunAction::Noop,

        (Real(_), Absent) => RunAction::Upload,
        (Real(local_time), Real(remote_time)) => match local_time.cmp(&remote_time) {
            Ordering::Less => RunAction::Download,
            Ordering::Greater => RunAction::Upload,
            Ordering::Equal => RunAction::Noop,
        },
        (Real(_), Ghost) => RunAction::DeleteLocalReal,

        (Ghost, Absent) => RunAction::DeleteLocalGhost,
        (Ghost, Real(_)) => RunAction::PropagateDeleteToRemote,
        (Ghost, Ghost) => RunAction::DeleteLocalGhost,
    }
}

/// Summary of one successful pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub aggregate: AggregateOutcome,
    pub downloaded: u32,
    pub uploaded: u32,
    pub remote_deletes: u32,
    pub local_deletes: u32,
    pub ghosts_cleared: u32,
}

impl SyncReport {
    fn record(&mut self, action: RunAction) {
        match action {
            RunAction::Noop => {}
            RunAction::Download => self.downloaded += 1,
            RunAction::Upload => self.uploaded += 1,
            RunAction::PropagateDeleteToRemote => self.remote_deletes += 1,
            RunAction::DeleteLocalReal => self.local_deletes += 1,
            RunAction::DeleteLocalGhost => self.ghosts_cleared += 1,
        }
    }

    /// Number of run ids that needed a mutation.
    pub fn run_mutations(&self) -> u32 {
        self.downloaded
            + self.uploaded
            + self.remote_deletes
            + self.local_deletes
            + self.ghosts_cleared
    }

    /// True if the pass changed nothing on either store.
    pub fn is_noop(&self) -> bool {
        self.aggregate == AggregateOutcome::Unchanged && self.run_mutations() == 0
    }
}

/// Presence of every id on one store, read once per pass.
struct PresenceSnapshot {
    states: BTreeMap<RunId, RecordState>,
}

impl PresenceSnapshot {
    fn read<S: StorageComponent + ?Sized>(store: &S) -> Result<Self> {
        let ghosts = store.list_ghost_ids()?;
        let mut states: BTreeMap<RunId, RecordState> =
            ghosts.iter().map(|id| (*id, RecordState::Ghost)).collect();

        for id in store.list_real_ids()? {
            if ghosts.contains(&id) {
                continue;
            }
            let edit_time = store.get_edit_time(id)?;
            let state = if edit_time.is_absent() {
                // Deleted between the listing and the lookup
                RecordState::Absent
            } else {
                RecordState::Real(edit_time)
            };
            states.insert(id, state);
        }
        Ok(Self { states })
    }

    fn state(&self, id: RunId) -> RecordState {
        self.states.get(&id).copied().unwrap_or(RecordState::Absent)
    }

    fn ids(&self) -> impl Iterator<Item = RunId> + '_ {
        self.states.keys().copied()
    }
}

/// Run one synchronization pass between `local` and `remote`.
///
/// The aggregate is reconciled first and acts as a gate: if it fails, run
/// records are not touched.
pub fn synchronize<L, R>(local: &mut L, remote: &mut R) -> Result<SyncReport>
where
    L: StorageComponent + ?Sized,
    R: StorageComponent + ?Sized,
{
    let start = Instant::now();
    let mut report = SyncReport {
        aggregate: synchronize_aggregate(local, remote)?,
        ..Default::default()
    };

    let local_states = PresenceSnapshot::read(local)?;
    let remote_states = PresenceSnapshot::read(remote)?;
    let ids: BTreeSet<RunId> = local_states.ids().chain(remote_states.ids()).collect();

    for id in ids {
        let action = plan(local_states.state(id), remote_states.state(id));
        if action != RunAction::Noop {
            debug!("[Synchronizer] Run {}: {:?}", id, action);
        }
        apply(local, remote, id, action).map_err(|e| {
            warn!("[Synchronizer] Run {} {:?} failed: {}", id, action, e);
            e
        })?;
        report.record(action);
    }

    info!(
        "[Synchronizer] Pass complete: aggregate={:?} down={} up={} remote_del={} local_del={} ghosts_cleared={} ({} ms)",
        report.aggregate,
        report.downloaded,
        report.uploaded,
        report.remote_deletes,
        report.local_deletes,
        report.ghosts_cleared,
        elapsed_ms(start)
    );
    Ok(report)
}

/// Last-writer-wins reconciliation of the aggregate record.
pub fn synchronize_aggregate<L, R>(local: &mut L, remote: &mut R) -> Result<AggregateOutcome>
where
    L: StorageComponent + ?Sized,
    R: StorageComponent + ?Sized,
{
    let local_time = local.get_aggregate_edit_time()?;
    let remote_time = remote.get_aggregate_edit_time()?;

    match local_time.cmp(&remote_time) {
        Ordering::Equal => Ok(AggregateOutcome::Unchanged),
        Ordering::Less => {
            let record = remote.get_aggregate()?.unwrap_or_default();
            local.save_aggregate(&record, Some(remote_time))?;
            debug!("[Synchronizer] Aggregate downloaded @ {}", remote_time);
            Ok(AggregateOutcome::Downloaded)
        }
        Ordering::Greater => {
            let record = local.get_aggregate()?.unwrap_or_default();
            if !remote_time.is_absent() {
                // The reset keeps the remote stamp, so the local copy stays
                // newer until the upload lands
                remote.save_aggregate(&AggregateRecord::default(), Some(remote_time))?;
            }
            remote.save_aggregate(&record, Some(local_time))?;
            debug!("[Synchronizer] Aggregate uploaded @ {}", local_time);
            Ok(AggregateOutcome::Uploaded)
        }
    }
}

fn apply<L, R>(local: &mut L, remote: &mut R, id: RunId, action: RunAction) -> Result<()>
where
    L: StorageComponent + ?Sized,
    R: StorageComponent + ?Sized,
{
    match action {
        RunAction::Noop => Ok(()),
        RunAction::Download => copy_record(&*remote, local, id),
        RunAction::Upload => copy_record(&*local, remote, id),
        RunAction::PropagateDeleteToRemote => {
            // Tombstone first so the record is never gone without one
            remote.save_ghost(id)?;
            remote.delete_record(id)
        }
        RunAction::DeleteLocalReal => local.delete_record(id),
        RunAction::DeleteLocalGhost => local.delete_ghost(id),
    }
}

/// Copy `id` from `source` to `target`, preserving the source edit time.
fn copy_record<S, T>(source: &S, target: &mut T, id: RunId) -> Result<()>
where
    S: StorageComponent + ?Sized,
    T: StorageComponent + ?Sized,
{
    let edit_time: EditTime = source.get_edit_time(id)?;
    let record = source.get_record(id)?.ok_or_else(|| {
        PersistenceError::unavailable(format!("Run {} disappeared during synchronization", id))
    })?;
    target.save_record(&record, Some(edit_time))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunRecord, RunTelemetry, UserToken};
    use crate::store::{MemoryStore, RemoteSession};

    fn stores() -> (MemoryStore, MemoryStore) {
        let token = UserToken::new("tester");
        let mut remote = MemoryStore::remote(token.clone());
        remote.connect().unwrap();
        (MemoryStore::new(token), remote)
    }

    fn run(id: i64, distance_m: f64) -> RunRecord {
        RunRecord::new(
            RunId(id),
            RunTelemetry {
                distance_m,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_plan_table() {
        use RecordState::*;
        let t1 = EditTime(1);
        let t2 = EditTime(2);

        assert_eq!(plan(Absent, Absent), RunAction::Noop);
        assert_eq!(plan(Absent, Real(t1)), RunAction::Download);
        assert_eq!(plan(Absent, Ghost), RunAction::Noop);
        assert_eq!(plan(Real(t1), Absent), RunAction::Upload);
        assert_eq!(plan(Real(t1), Real(t2)), RunAction::Download);
        assert_eq!(plan(Real(t2), Real(t1)), RunAction::Upload);
        assert_eq!(plan(Real(t1), Real(t1)), RunAction::Noop);
        assert_eq!(plan(Real(t2), Ghost), RunAction::DeleteLocalReal);
        assert_eq!(plan(Ghost, Absent), RunAction::DeleteLocalGhost);
        assert_eq!(plan(Ghost, Real(t2)), RunAction::PropagateDeleteToRemote);
        assert_eq!(plan(Ghost, Ghost), RunAction::DeleteLocalGhost);
    }

    #[test]
    fn test_upload_keeps_edit_time() {
        let (mut local, mut remote) = stores();
        let t1 = local.save_record(&run(1000, 5000.0), None).unwrap();

        let report = synchronize(&mut local, &mut remote).unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(remote.get_edit_time(RunId(1000)).unwrap(), t1);
        assert_eq!(remote.get_record(RunId(1000)).unwrap(), Some(run(1000, 5000.0)));
    }

    #[test]
    fn test_newer_remote_overwrites_local() {
        let (mut local, mut remote) = stores();
        local.save_record(&run(5, 1.0), Some(EditTime(10))).unwrap();
        remote.save_record(&run(5, 2.0), Some(EditTime(20))).unwrap();

        let report = synchronize(&mut local, &mut remote).unwrap();

        assert_eq!(report.downloaded, 1);
        assert_eq!(local.get_record(RunId(5)).unwrap(), Some(run(5, 2.0)));
        assert_eq!(local.get_edit_time(RunId(5)).unwrap(), EditTime(20));
    }

    #[test]
    fn test_aggregate_upload_and_download() {
        let (mut local, mut remote) = stores();
        let mine = AggregateRecord {
            number_of_runs: 4,
            ..Default::default()
        };
        let t = local.save_aggregate(&mine, None).unwrap();

        assert_eq!(
            synchronize_aggregate(&mut local, &mut remote).unwrap(),
            AggregateOutcome::Uploaded
        );
        assert_eq!(remote.get_aggregate().unwrap(), Some(mine));
        assert_eq!(remote.get_aggregate_edit_time().unwrap(), t);
        assert_eq!(
            synchronize_aggregate(&mut local, &mut remote).unwrap(),
            AggregateOutcome::Unchanged
        );
    }

    #[test]
    fn test_interrupted_aggregate_upload_is_retried() {
        let (mut local, mut remote) = stores();
        let stale = AggregateRecord {
            number_of_runs: 3,
            ..Default::default()
        };
        let mine = AggregateRecord {
            number_of_runs: 7,
            ..Default::default()
        };
        remote.save_aggregate(&stale, Some(EditTime(10))).unwrap();
        local.save_aggregate(&mine, Some(EditTime(20))).unwrap();

        // Reset lands, the upload does not
        remote.fail_writes_after(1);
        assert!(matches!(
            synchronize_aggregate(&mut local, &mut remote),
            Err(PersistenceError::LocalWriteFailed { .. })
        ));
        assert!(remote.get_aggregate_edit_time().unwrap() <= EditTime(10));
        assert_eq!(local.get_aggregate().unwrap(), Some(mine.clone()));

        remote.set_fail_writes(false);
        assert_eq!(
            synchronize_aggregate(&mut local, &mut remote).unwrap(),
            AggregateOutcome::Uploaded
        );
        assert_eq!(remote.get_aggregate().unwrap(), Some(mine.clone()));
        assert_eq!(remote.get_aggregate_edit_time().unwrap(), EditTime(20));
        assert_eq!(local.get_aggregate().unwrap(), Some(mine));
    }

    #[test]
    fn test_corrupt_record_aborts_pass() {
        let (mut local, mut remote) = stores();
        local.save_record(&run(1, 1.0), None).unwrap();
        local.save_record(&run(2, 1.0), None).unwrap();
        local.corrupt_record(RunId(1));

        let result = synchronize(&mut local, &mut remote);

        assert!(matches!(result, Err(PersistenceError::CorruptData { .. })));
        // Ids are processed in order; the failure stops the rest of the pass
        assert!(remote.list_real_ids().unwrap().is_empty());
    }

    #[test]
    fn test_remote_delete_writes_ghost_first() {
        let (mut local, mut remote) = stores();
        remote.save_record(&run(9, 1.0), None).unwrap();
        local.save_ghost(RunId(9)).unwrap();

        let report = synchronize(&mut local, &mut remote).unwrap();

        assert_eq!(report.remote_deletes, 1);
        assert!(remote.list_ghost_ids().unwrap().contains(&RunId(9)));
        assert!(!remote.list_real_ids().unwrap().contains(&RunId(9)));
        assert!(local.list_ghost_ids().unwrap().contains(&RunId(9)));
    }

    #[test]
    fn test_report_noop() {
        assert!(SyncReport::default().is_noop());
        let report = SyncReport {
            ghosts_cleared: 1,
            ..Default::default()
        };
        assert!(!report.is_noop());
        assert_eq!(report.run_mutations(), 1);
    }
}
