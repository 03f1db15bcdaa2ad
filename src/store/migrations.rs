//! Local schema migrations and legacy-record adoption.

use log::info;
use rusqlite::{params, Connection};
use rusqlite_migration::{Migrations, M};

use crate::error::{PersistenceError, Result, SqlResultExt};
use crate::model::UserToken;

/// Token value carried by records written before per-user namespacing.
pub const LEGACY_TOKEN: &str = "";

/// Schema history. Append only: existing entries must never change.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // v1: run records, tombstones and the aggregate slot, namespaced by
        // user token. Legacy rows carry an empty token until adopted.
        M::up(
            r#"
            CREATE TABLE runs (
                user_token TEXT NOT NULL DEFAULT '',
                run_id INTEGER NOT NULL,
                payload BLOB NOT NULL,
                edit_time INTEGER NOT NULL,
                PRIMARY KEY (user_token, run_id)
            );

            -- Tombstones live apart from real records so listing one never
            -- returns the other
            CREATE TABLE ghosts (
                user_token TEXT NOT NULL DEFAULT '',
                run_id INTEGER NOT NULL,
                deleted_at INTEGER NOT NULL,
                PRIMARY KEY (user_token, run_id)
            );

            CREATE TABLE aggregates (
                user_token TEXT PRIMARY KEY NOT NULL DEFAULT '',
                payload BLOB NOT NULL,
                edit_time INTEGER NOT NULL
            );
            "#,
        ),
        // v2: edit-time lookups during reconciliation
        M::up("CREATE INDEX idx_runs_edit_time ON runs(user_token, edit_time);"),
    ])
}

/// Bring the schema to the latest version.
pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    migrations()
        .to_latest(conn)
        .map_err(|e| PersistenceError::write_failed(format!("Schema migration failed: {}", e)))
}

/// Check whether any un-namespaced rows are left.
pub fn has_legacy_records(conn: &Connection) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM runs WHERE user_token = ?1)
                  + (SELECT COUNT(*) FROM ghosts WHERE user_token = ?1)
                  + (SELECT COUNT(*) FROM aggregates WHERE user_token = ?1)",
            params![LEGACY_TOKEN],
            |row| row.get(0),
        )
        .or_unavailable("Failed to count legacy records")?;
    Ok(count > 0)
}

/// Adopt un-namespaced records into `token`'s namespace.
///
/// Idempotent. Where the user already has a namespaced row with the same key
/// the namespaced row wins and the legacy duplicate is dropped. Returns the
/// number of rows adopted.
pub fn adopt_legacy_records(conn: &mut Connection, token: &UserToken) -> Result<usize> {
    if token.as_str() == LEGACY_TOKEN {
        return Ok(0);
    }
    if !has_legacy_records(conn)? {
        return Ok(0);
    }

    info!("[LocalStore] Running migration: adopt_legacy_records");

    let tx = conn
        .transaction()
        .or_write_failed("Failed to begin legacy adoption")?;
    let mut adopted = 0;
    for table in ["runs", "ghosts", "aggregates"] {
        adopted += tx
            .execute(
                &format!(
                    "UPDATE OR IGNORE {} SET user_token = ?1 WHERE user_token = ?2",
                    table
                ),
                params![token.as_str(), LEGACY_TOKEN],
            )
            .or_write_failed("Failed to adopt legacy records")?;
        tx.execute(
            &format!("DELETE FROM {} WHERE user_token = ?1", table),
            params![LEGACY_TOKEN],
        )
        .or_write_failed("Failed to drop shadowed legacy records")?;
    }
    tx.commit()
        .or_write_failed("Failed to commit legacy adoption")?;

    info!(
        "[LocalStore] Migration adopt_legacy_records completed: {} rows adopted",
        adopted
    );
    Ok(adopted)
}
