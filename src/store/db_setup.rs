use rusqlite::Connection;

use crate::error::{ConsensusError, Result};
use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "1";

pub(super) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| ConsensusError::persistence("failed to set journal_mode=WAL", err))?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| ConsensusError::persistence("failed to set synchronous=NORMAL", err))?;
    Ok(())
}

pub(super) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS field_states (
              field TEXT PRIMARY KEY,
              annotators_json TEXT NOT NULL,
              feature_dim INTEGER NOT NULL,
              row_count INTEGER NOT NULL,
              estimator_json TEXT NOT NULL,
              result_json TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS field_examples (
              field TEXT NOT NULL,
              row_idx INTEGER NOT NULL,
              labels_json TEXT NOT NULL,
              features_json TEXT NOT NULL,
              PRIMARY KEY (field, row_idx)
            );

            CREATE TABLE IF NOT EXISTS training_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              field TEXT NOT NULL,
              trained_at TEXT NOT NULL,
              examples INTEGER NOT NULL,
              annotators INTEGER NOT NULL,
              fold_count INTEGER NOT NULL,
              avg_consensus_quality REAL,
              duration_ms INTEGER NOT NULL,
              changes_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_training_history_field ON training_history(field, id);
            ",
        )
        .map_err(|err| ConsensusError::persistence("failed to create store schema", err))?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_opened_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}
