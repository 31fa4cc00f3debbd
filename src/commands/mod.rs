pub mod ingest;
pub mod lookup;
pub mod status;
pub mod train;

use std::io::{self, Write};

use anyhow::{Context, Result};
use neurograde::EngineConfig;
use neurograde::orchestrator::Orchestrator;
use neurograde::store::{ConsensusRecordStore, SqliteFieldStore};
use serde::Serialize;
use tracing::debug;

use crate::cli::StoreArgs;

pub(crate) fn open_orchestrator(
    store: &StoreArgs,
    config: EngineConfig,
) -> Result<Orchestrator<SqliteFieldStore>> {
    let db_path = store.resolved_db_path();
    let record_path = store.resolved_record_path();

    let field_store = SqliteFieldStore::open(&db_path)
        .with_context(|| format!("failed to open field store {}", db_path.display()))?;
    debug!(
        db_path = %db_path.display(),
        record_path = %record_path.display(),
        "opened stores"
    );

    Ok(Orchestrator::new(
        field_store,
        ConsensusRecordStore::new(record_path),
        config,
    ))
}

pub(crate) fn write_json_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, value).context("failed to serialize json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}
