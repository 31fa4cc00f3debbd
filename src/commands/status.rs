use anyhow::Result;
use neurograde::{EngineConfig, Field};
use neurograde::store::DB_SCHEMA_VERSION;
use tracing::{info, warn};

use super::open_orchestrator;
use crate::cli::StatusArgs;

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args.store.resolved_db_path();
    info!(data_root = %args.store.data_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let orchestrator = open_orchestrator(&args.store, EngineConfig::default())?;
    info!(
        path = %db_path.display(),
        schema_version = DB_SCHEMA_VERSION,
        "database status"
    );

    let summaries = orchestrator.field_summaries()?;
    if summaries.is_empty() {
        warn!("no trained fields");
    }
    for summary in &summaries {
        info!(
            field = %summary.field,
            examples = summary.example_count,
            annotators = summary.annotator_count,
            mean_quality = summary.mean_consensus_quality.unwrap_or_default(),
            min_quality = summary.min_consensus_quality.unwrap_or_default(),
            max_quality = summary.max_consensus_quality.unwrap_or_default(),
            mean_agreement = summary.mean_annotator_agreement.unwrap_or_default(),
            mean_annotations = summary.mean_annotations_per_example.unwrap_or_default(),
            mean_annotator_quality = summary.mean_annotator_quality.unwrap_or_default(),
            updated_at = %summary.updated_at,
            "field status"
        );

        if args.history {
            let Some(field) = Field::from_name(&summary.field) else {
                continue;
            };
            for record in orchestrator.training_history(field)? {
                info!(
                    field = %record.field,
                    trained_at = %record.trained_at,
                    examples = record.examples,
                    annotators = record.annotators,
                    folds = record.fold_count,
                    avg_quality = record.avg_consensus_quality.unwrap_or_default(),
                    duration_ms = record.duration_ms,
                    "training run"
                );
            }
        }
    }

    let record_path = orchestrator.records().path().to_path_buf();
    if record_path.exists() {
        let record = orchestrator.records().load()?;
        info!(path = %record_path.display(), scans = record.len(), "consensus record status");
    } else {
        warn!(path = %record_path.display(), "consensus record missing");
    }

    Ok(())
}
