use anyhow::Result;
use neurograde::{EngineConfig, Field};
use tracing::{info, warn};

use super::{open_orchestrator, write_json_stdout};
use crate::cli::LookupArgs;

pub fn run(args: LookupArgs) -> Result<()> {
    let orchestrator = open_orchestrator(&args.store, EngineConfig::default())?;

    let Some(name) = args.field.as_deref() else {
        let Some(consensus) = orchestrator.records().scan(&args.scan_id)? else {
            warn!(scan_id = %args.scan_id, "scan not found in consensus record");
            return Ok(());
        };
        return write_json_stdout(&consensus);
    };

    let field: Field = name.parse()?;

    let value = orchestrator.lookup(&args.scan_id, field)?;
    info!(
        scan_id = %args.scan_id,
        field = %field,
        resolved = value.is_some(),
        "lookup complete"
    );
    write_json_stdout(&value)
}
