//! # Local Store
//!
//! On-device store backed by SQLite. Every row is keyed by the bound user
//! token plus the logical id, and every query filters on the token, so a
//! user only ever sees their own records.
//!
//! Payloads are MessagePack blobs. A blob that fails to decode is reported as
//! `CorruptData` rather than absent so corruption stays distinguishable from
//! "never existed".

use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{DecodeResultExt, PersistenceError, Result, SqlResultExt};
use crate::model::{AggregateRecord, EditClock, EditTime, RunId, RunRecord, UserToken};
use crate::store::migrations;
use crate::store::StorageComponent;

/// SQLite-backed [`StorageComponent`].
pub struct LocalStore {
    db: Connection,
    token: UserToken,
    clock: EditClock,
}

impl LocalStore {
    /// Open (or create) the database at `path` for `token`.
    ///
    /// Runs schema migrations, then adopts any legacy un-namespaced records
    /// into `token`'s namespace.
    pub fn open(path: impl AsRef<Path>, token: UserToken) -> Result<Self> {
        let path = path.as_ref();
        info!("[LocalStore] Opening database: {}", path.display());
        let db = Connection::open(path).or_unavailable("Failed to open database")?;
        Self::from_connection(db, token)
    }

    /// In-memory database (for testing).
    pub fn in_memory(token: UserToken) -> Result<Self> {
        let db = Connection::open_in_memory().or_unavailable("Failed to open database")?;
        Self::from_connection(db, token)
    }

    fn from_connection(mut db: Connection, token: UserToken) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )
        .or_unavailable("Failed to configure database")?;
        migrations::migrate_to_latest(&mut db)?;
        migrations::adopt_legacy_records(&mut db, &token)?;

        let floor: i64 = db
            .query_row(
                "SELECT MAX(t) FROM (SELECT MAX(edit_time) AS t FROM runs
                                     UNION ALL SELECT MAX(edit_time) FROM aggregates)",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .or_unavailable("Failed to read edit-time high-water mark")?
            .unwrap_or(0);

        Ok(Self {
            db,
            token,
            clock: EditClock::seeded(EditTime(floor)),
        })
    }

    fn list_ids(&self, table: &str) -> Result<BTreeSet<RunId>> {
        let mut stmt = self
            .db
            .prepare(&format!(
                "SELECT run_id FROM {} WHERE user_token = ?1",
                table
            ))
            .or_unavailable("Failed to prepare id listing")?;
        let ids = stmt
            .query_map(params![self.token.as_str()], |row| row.get::<_, i64>(0))
            .or_unavailable("Failed to list ids")?
            .map(|r| r.map(RunId))
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .or_unavailable("Failed to read id row")?;
        Ok(ids)
    }

    fn stamp(&self, hint: Option<EditTime>) -> EditTime {
        match hint {
            Some(edit_time) => {
                self.clock.observe(edit_time);
                edit_time
            }
            None => self.clock.next(),
        }
    }
}

fn run_key(id: RunId) -> String {
    format!("run/{}", id)
}

fn decode_run(id: RunId, payload: &[u8]) -> Result<RunRecord> {
    rmp_serde::from_slice(payload).or_corrupt(&run_key(id))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| PersistenceError::write_failed(format!("Failed to encode record: {}", e)))
}

impl StorageComponent for LocalStore {
    fn bind_user(&mut self, token: &UserToken) {
        if &self.token != token {
            info!("[LocalStore] Rebinding to a new user namespace");
            self.token = token.clone();
        }
    }

    fn list_real_ids(&self) -> Result<BTreeSet<RunId>> {
        self.list_ids("runs")
    }

    fn list_ghost_ids(&self) -> Result<BTreeSet<RunId>> {
        self.list_ids("ghosts")
    }

    fn load_runs_newest_first(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT run_id, payload FROM runs WHERE user_token = ?1 ORDER BY run_id DESC",
            )
            .or_unavailable("Failed to prepare run listing")?;
        let rows: Vec<(i64, Vec<u8>)> = stmt
            .query_map(params![self.token.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .or_unavailable("Failed to list runs")?
            .collect::<std::result::Result<_, _>>()
            .or_unavailable("Failed to read run row")?;

        rows.into_iter()
            .map(|(id, payload)| decode_run(RunId(id), &payload))
            .collect()
    }

    fn get_record(&self, id: RunId) -> Result<Option<RunRecord>> {
        let payload: Option<Vec<u8>> = self
            .db
            .query_row(
                "SELECT payload FROM runs WHERE user_token = ?1 AND run_id = ?2",
                params![self.token.as_str(), id.0],
                |row| row.get(0),
            )
            .optional()
            .or_unavailable("Failed to read run")?;

        payload.map(|bytes| decode_run(id, &bytes)).transpose()
    }

    fn save_record(
        &mut self,
        record: &RunRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let payload = encode(record)?;
        let edit_time = self.stamp(edit_time);
        self.db
            .execute(
                "INSERT OR REPLACE INTO runs (user_token, run_id, payload, edit_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.token.as_str(), record.id.0, payload, edit_time.0],
            )
            .or_write_failed("Failed to save run")?;
        debug!("[LocalStore] Saved run {} @ {}", record.id, edit_time);
        Ok(edit_time)
    }

    fn get_edit_time(&self, id: RunId) -> Result<EditTime> {
        let edit_time: Option<i64> = self
            .db
            .query_row(
                "SELECT edit_time FROM runs WHERE user_token = ?1 AND run_id = ?2",
                params![self.token.as_str(), id.0],
                |row| row.get(0),
            )
            .optional()
            .or_unavailable("Failed to read edit time")?;
        Ok(edit_time.map(EditTime).unwrap_or(EditTime::ABSENT))
    }

    fn delete_record(&mut self, id: RunId) -> Result<()> {
        self.db
            .execute(
                "DELETE FROM runs WHERE user_token = ?1 AND run_id = ?2",
                params![self.token.as_str(), id.0],
            )
            .or_write_failed("Failed to delete run")?;
        debug!("[LocalStore] Deleted run {}", id);
        Ok(())
    }

    fn save_ghost(&mut self, id: RunId) -> Result<()> {
        let deleted_at = self.clock.next();
        self.db
            .execute(
                "INSERT OR REPLACE INTO ghosts (user_token, run_id, deleted_at) VALUES (?1, ?2, ?3)",
                params![self.token.as_str(), id.0, deleted_at.0],
            )
            .or_write_failed("Failed to save ghost")?;
        debug!("[LocalStore] Saved ghost {}", id);
        Ok(())
    }

    fn delete_ghost(&mut self, id: RunId) -> Result<()> {
        self.db
            .execute(
                "DELETE FROM ghosts WHERE user_token = ?1 AND run_id = ?2",
                params![self.token.as_str(), id.0],
            )
            .or_write_failed("Failed to delete ghost")?;
        debug!("[LocalStore] Deleted ghost {}", id);
        Ok(())
    }

    fn get_aggregate(&self) -> Result<Option<AggregateRecord>> {
        let payload: Option<Vec<u8>> = self
            .db
            .query_row(
                "SELECT payload FROM aggregates WHERE user_token = ?1",
                params![self.token.as_str()],
                |row| row.get(0),
            )
            .optional()
            .or_unavailable("Failed to read aggregate")?;

        payload
            .map(|bytes| rmp_serde::from_slice(&bytes).or_corrupt("aggregate"))
            .transpose()
    }

    fn get_aggregate_edit_time(&self) -> Result<EditTime> {
        let edit_time: Option<i64> = self
            .db
            .query_row(
                "SELECT edit_time FROM aggregates WHERE user_token = ?1",
                params![self.token.as_str()],
                |row| row.get(0),
            )
            .optional()
            .or_unavailable("Failed to read aggregate edit time")?;
        Ok(edit_time.map(EditTime).unwrap_or(EditTime::ABSENT))
    }

    fn save_aggregate(
        &mut self,
        record: &AggregateRecord,
        edit_time: Option<EditTime>,
    ) -> Result<EditTime> {
        let payload = encode(record)?;
        let edit_time = self.stamp(edit_time);
        self.db
            .execute(
                "INSERT OR REPLACE INTO aggregates (user_token, payload, edit_time) VALUES (?1, ?2, ?3)",
                params![self.token.as_str(), payload, edit_time.0],
            )
            .or_write_failed("Failed to save aggregate")?;
        debug!("[LocalStore] Saved aggregate @ {}", edit_time);
        Ok(edit_time)
    }
}
