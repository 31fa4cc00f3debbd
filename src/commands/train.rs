use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use neurograde::model::TrainingDocument;
use neurograde::util::write_json_pretty;
use tracing::{info, warn};

use super::{open_orchestrator, write_json_stdout};
use crate::cli::TrainArgs;

pub fn run(args: TrainArgs) -> Result<()> {
    let raw = fs::read(&args.labels)
        .with_context(|| format!("failed to read {}", args.labels.display()))?;
    let document: TrainingDocument = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse training document {}", args.labels.display()))?;

    let mut labels = BTreeMap::new();
    let mut features = BTreeMap::new();
    for (field, set) in document {
        let (field_labels, field_features) = set
            .into_matrices()
            .with_context(|| format!("invalid matrices for field {field}"))?;
        labels.insert(field.clone(), field_labels);
        features.insert(field, field_features);
    }

    info!(
        labels = %args.labels.display(),
        fields = labels.len(),
        force_retrain = args.force_retrain,
        classifier = args.engine.classifier.as_str(),
        "training requested"
    );

    let mut orchestrator = open_orchestrator(&args.store, args.engine.config())?;
    let outcomes = orchestrator
        .train_fields(&labels, &features, args.force_retrain)
        .context("failed to train fields")?;

    let failed = outcomes.values().filter(|outcome| outcome.error.is_some()).count();
    if failed > 0 {
        warn!(failed, "some fields failed to train");
    }

    match &args.output {
        Some(path) => {
            write_json_pretty(path, &outcomes)?;
            info!(path = %path.display(), "wrote training outcomes");
        }
        None => write_json_stdout(&outcomes)?,
    }
    Ok(())
}
