use std::fs;

use anyhow::{Context, Result};
use neurograde::model::ScanBatch;
use neurograde::util::write_json_pretty;
use tracing::{info, warn};

use super::{open_orchestrator, write_json_stdout};
use crate::cli::IngestArgs;

pub fn run(args: IngestArgs) -> Result<()> {
    let raw = fs::read(&args.batch)
        .with_context(|| format!("failed to read {}", args.batch.display()))?;
    let batch: ScanBatch = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse scan batch {}", args.batch.display()))?;

    let config = args.engine.config();

    info!(
        batch = %args.batch.display(),
        scans = batch.len(),
        force_retrain = args.force_retrain,
        classifier = args.engine.classifier.as_str(),
        "ingest requested"
    );

    let mut orchestrator = open_orchestrator(&args.store, config)?;
    let summary = orchestrator
        .add_scans(&batch, args.force_retrain)
        .context("failed to ingest scan batch")?;

    for (field, outcome) in &summary.fields {
        match &outcome.error {
            Some(error) => warn!(field = %field, error = %error, "field failed"),
            None => info!(
                field = %field,
                status = outcome.status.as_str(),
                reused_existing = outcome.reused_existing,
                examples = outcome.examples,
                annotators = outcome.annotators,
                "field processed"
            ),
        }
    }

    match &args.output {
        Some(path) => {
            write_json_pretty(path, &summary)?;
            info!(path = %path.display(), "wrote batch summary");
        }
        None => write_json_stdout(&summary)?,
    }

    info!(scans = summary.count, "ingest completed");
    Ok(())
}
