mod summary;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::change::{ChangeDetector, ChangeReport};
use crate::config::EngineConfig;
use crate::encoder::encode_batch;
use crate::error::{ConsensusError, Result};
use crate::estimator::{ConsensusEstimator, ConsensusResult, score_with_state};
use crate::features::{FeatureProvider, PlaceholderFeatureProvider, feature_matrix};
use crate::matrix::{AnnotationMatrix, FeatureMatrix, union_annotators};
use crate::model::{
    BatchSummary, FieldOutcome, FieldStatus, FieldSummary, ScanBatch, ScanConsensus,
    ScanConsensusRecord, TrainingRecord,
};
use crate::schema::{Field, is_presence_field};
use crate::store::{ConsensusRecordStore, FieldState, FieldStore};
use crate::util::now_utc_string;

pub use summary::summarize_field;

/// Synthetic rows added next to a lone first scan so stratified folds exist.
const SINGLE_SCAN_REPLICAS: usize = 3;

struct FieldRun {
    outcome: FieldOutcome,
    values: Vec<Option<String>>,
}

/// Owns the field store, the consensus record and the feature provider for
/// one deployment. Calls to [`Orchestrator::add_scans`] must not overlap.
pub struct Orchestrator<S: FieldStore> {
    store: S,
    records: ConsensusRecordStore,
    features: Box<dyn FeatureProvider>,
    config: EngineConfig,
}

impl<S: FieldStore> Orchestrator<S> {
    pub fn new(store: S, records: ConsensusRecordStore, config: EngineConfig) -> Self {
        Self {
            store,
            records,
            features: Box::new(PlaceholderFeatureProvider::new(config.seed)),
            config,
        }
    }

    pub fn with_feature_provider(mut self, provider: Box<dyn FeatureProvider>) -> Self {
        self.features = provider;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn records(&self) -> &ConsensusRecordStore {
        &self.records
    }

    pub fn add_scans(&mut self, batch: &ScanBatch, force_retrain: bool) -> Result<BatchSummary> {
        let started = Instant::now();
        let scan_ids: Vec<String> = batch.keys().cloned().collect();
        report_unknown_fields(batch);

        let mut consensus_by_scan: ScanConsensusRecord = scan_ids
            .iter()
            .map(|scan_id| (scan_id.clone(), ScanConsensus::new()))
            .collect();
        let mut fields = BTreeMap::new();

        if scan_ids.is_empty() {
            info!("empty scan batch; nothing to ingest");
            return Ok(BatchSummary {
                scan_ids,
                count: 0,
                consensus_by_scan,
                timestamp: now_utc_string(),
                fields,
            });
        }

        for field in Field::ALL {
            let run = match self.process_field(field, batch, &scan_ids, force_retrain) {
                Ok(run) => run,
                Err(err) => {
                    warn!(field = %field, error = %err, "field processing failed");
                    FieldRun {
                        outcome: FieldOutcome::failed(err.to_string()),
                        values: vec![None; scan_ids.len()],
                    }
                }
            };

            for (scan_id, value) in scan_ids.iter().zip(run.values) {
                if let Some(consensus) = consensus_by_scan.get_mut(scan_id) {
                    consensus.insert(field.name().to_string(), value);
                }
            }
            fields.insert(field.name().to_string(), run.outcome);
        }

        let record = self.records.merge(&consensus_by_scan)?;
        info!(
            scans = scan_ids.len(),
            record_size = record.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "batch ingested"
        );

        Ok(BatchSummary {
            count: scan_ids.len(),
            scan_ids,
            consensus_by_scan,
            timestamp: now_utc_string(),
            fields,
        })
    }

    fn process_field(
        &mut self,
        field: Field,
        batch: &ScanBatch,
        scan_ids: &[String],
        force_retrain: bool,
    ) -> Result<FieldRun> {
        let labels = encode_batch(field, batch, scan_ids)?;
        let prior = self.store.load(field)?;

        if prior.is_none() && !labels.has_annotations() {
            debug!(field = %field, "no usable annotations and no history; skipping");
            return Ok(FieldRun {
                outcome: FieldOutcome {
                    status: FieldStatus::Skipped,
                    reused_existing: false,
                    changes: None,
                    examples: 0,
                    annotators: labels.num_annotators(),
                    error: None,
                },
                values: vec![None; scan_ids.len()],
            });
        }

        let dimensions = prior
            .as_ref()
            .map(|state| state.features.dimensions())
            .unwrap_or(self.config.feature_dimensions);
        let features = feature_matrix(self.features.as_ref(), field, scan_ids, dimensions)?;

        let detector: ChangeDetector = self.config.change_detector();
        let changes = detector.detect(field, &labels, &features, prior.as_ref());

        match prior {
            Some(prior) if !changes.requires_retraining && !force_retrain => {
                let values = self.reuse(field, &prior, &labels, &features)?;
                Ok(FieldRun {
                    outcome: FieldOutcome {
                        status: FieldStatus::Reused,
                        reused_existing: true,
                        changes: Some(changes),
                        examples: prior.annotations.num_rows(),
                        annotators: prior.annotations.num_annotators(),
                        error: None,
                    },
                    values,
                })
            }
            prior => self.retrain(field, prior, labels, features, changes),
        }
    }

    /// Scores the new rows with the stored estimator; nothing is persisted.
    fn reuse(
        &self,
        field: Field,
        prior: &FieldState,
        labels: &AnnotationMatrix,
        features: &FeatureMatrix,
    ) -> Result<Vec<Option<String>>> {
        let aligned = labels.reindex(prior.annotations.annotators());
        let scored = score_with_state(&prior.estimator, &aligned, features)?;
        info!(
            field = %field,
            new_rows = labels.num_rows(),
            history_rows = prior.annotations.num_rows(),
            "reusing stored estimator"
        );
        Ok(extract_values(field, &scored, 0, labels.num_rows()))
    }

    fn retrain(
        &mut self,
        field: Field,
        prior: Option<FieldState>,
        labels: AnnotationMatrix,
        features: FeatureMatrix,
        changes: ChangeReport,
    ) -> Result<FieldRun> {
        let new_rows = labels.num_rows();
        let (mut merged_labels, mut merged_features, offset, keep_rows) = match &prior {
            Some(prior) => {
                let columns = union_annotators(prior.annotations.annotators(), labels.annotators());
                debug!(
                    field = %field,
                    history_rows = prior.annotations.num_rows(),
                    new_rows,
                    annotators = columns.len(),
                    "merging batch with history"
                );
                let merged_labels = prior
                    .annotations
                    .reindex(&columns)
                    .concat(&labels.reindex(&columns));
                let merged_features = prior.features.concat(&features)?;
                (merged_labels, merged_features, prior.annotations.num_rows(), None)
            }
            None if new_rows == 1 => {
                debug!(field = %field, replicas = SINGLE_SCAN_REPLICAS, "replicating lone first scan");
                let (labels, features) = replicate_single_scan(field, &labels, &features)?;
                (labels, features, 0, Some(1))
            }
            None => (labels, features, 0, None),
        };

        let estimator = ConsensusEstimator::new(self.config.estimator());
        let run = estimator.run(&merged_labels, &merged_features, self.config.folds)?;
        let mut result = run.result;
        if let Some(keep) = keep_rows {
            merged_labels.truncate(keep);
            merged_features.truncate(keep);
            result.truncate(keep);
            result.refresh_annotator_stats(&merged_labels, &run.state.weights)?;
        }

        let values = extract_values(field, &result, offset, new_rows);
        let state = FieldState {
            field,
            annotations: merged_labels,
            features: merged_features,
            estimator: run.state,
            result,
            updated_at: now_utc_string(),
        };
        let record = training_record(&state, &changes);
        self.store.save(&state, Some(&record))?;

        info!(
            field = %field,
            examples = record.examples,
            annotators = record.annotators,
            folds = record.fold_count,
            avg_quality = record.avg_consensus_quality.unwrap_or(0.0),
            "field retrained"
        );

        Ok(FieldRun {
            outcome: FieldOutcome {
                status: FieldStatus::Retrained,
                reused_existing: false,
                changes: Some(changes),
                examples: record.examples,
                annotators: record.annotators,
                error: None,
            },
            values,
        })
    }

    /// Trains fields from complete, already encoded matrices keyed by field
    /// name. A retrained field's history is replaced by the given matrices;
    /// no scan record is written since the rows carry no scan ids.
    pub fn train_fields(
        &mut self,
        labels_by_field: &BTreeMap<String, AnnotationMatrix>,
        features_by_field: &BTreeMap<String, FeatureMatrix>,
        force_retrain: bool,
    ) -> Result<BTreeMap<String, FieldOutcome>> {
        let started = Instant::now();
        let mut outcomes = BTreeMap::new();

        for (name, labels) in labels_by_field {
            if is_presence_field(name) {
                info!(field = %name, "presence field is always positive; skipping");
                continue;
            }
            let outcome =
                match self.train_field(name, labels, features_by_field.get(name), force_retrain) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(field = %name, error = %err, "field training failed");
                        FieldOutcome::failed(err.to_string())
                    }
                };
            outcomes.insert(name.clone(), outcome);
        }

        log_training_summary(&outcomes, started.elapsed());
        Ok(outcomes)
    }

    fn train_field(
        &mut self,
        name: &str,
        labels: &AnnotationMatrix,
        features: Option<&FeatureMatrix>,
        force_retrain: bool,
    ) -> Result<FieldOutcome> {
        let field: Field = name.parse()?;
        let features = features.ok_or_else(|| {
            ConsensusError::Validation(format!("no feature matrix supplied for {field}"))
        })?;
        if let Some(label) = labels.max_label().filter(|label| *label >= field.num_classes()) {
            return Err(ConsensusError::Validation(format!(
                "label index {label} is out of range for {field} ({} categories)",
                field.num_classes()
            )));
        }

        let prior = self.store.load(field)?;
        let changes = self
            .config
            .change_detector()
            .detect_snapshot(field, labels, features, prior.as_ref());

        if let Some(prior) = prior.filter(|_| !changes.requires_retraining && !force_retrain) {
            debug!(field = %field, "stored estimator is current");
            return Ok(FieldOutcome {
                status: FieldStatus::Reused,
                reused_existing: true,
                changes: Some(changes),
                examples: prior.annotations.num_rows(),
                annotators: prior.annotations.num_annotators(),
                error: None,
            });
        }

        let run = ConsensusEstimator::new(self.config.estimator()).run(
            labels,
            features,
            self.config.folds,
        )?;
        let state = FieldState {
            field,
            annotations: labels.clone(),
            features: features.clone(),
            estimator: run.state,
            result: run.result,
            updated_at: now_utc_string(),
        };
        let record = training_record(&state, &changes);
        self.store.replace(&state, Some(&record))?;

        Ok(FieldOutcome {
            status: FieldStatus::Retrained,
            reused_existing: false,
            changes: Some(changes),
            examples: record.examples,
            annotators: record.annotators,
            error: None,
        })
    }

    pub fn lookup(&self, scan_id: &str, field: Field) -> Result<Option<String>> {
        self.records.lookup(scan_id, field.name())
    }

    pub fn field_summary(&self, field: Field) -> Result<Option<FieldSummary>> {
        Ok(self.store.load(field)?.map(|state| summarize_field(&state)))
    }

    pub fn field_summaries(&self) -> Result<Vec<FieldSummary>> {
        let mut summaries = Vec::new();
        for field in self.store.fields()? {
            if let Some(summary) = self.field_summary(field)? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    pub fn training_history(&self, field: Field) -> Result<Vec<TrainingRecord>> {
        self.store.history(field)
    }
}

fn training_record(state: &FieldState, changes: &ChangeReport) -> TrainingRecord {
    TrainingRecord {
        field: state.field.name().to_string(),
        trained_at: state.estimator.training.trained_at.clone(),
        examples: state.annotations.num_rows(),
        annotators: state.annotations.num_annotators(),
        fold_count: state.estimator.training.fold_count,
        avg_consensus_quality: state.result.mean_consensus_quality(),
        duration_ms: state.estimator.training.duration_ms,
        changes: Some(changes.clone()),
    }
}

fn log_training_summary(outcomes: &BTreeMap<String, FieldOutcome>, elapsed: Duration) {
    for (field, outcome) in outcomes {
        info!(
            field = %field,
            status = outcome.status.as_str(),
            examples = outcome.examples,
            annotators = outcome.annotators,
            "field training outcome"
        );
    }
    let count = |status: FieldStatus| {
        outcomes
            .values()
            .filter(|outcome| outcome.status == status)
            .count()
    };
    info!(
        retrained = count(FieldStatus::Retrained),
        reused = count(FieldStatus::Reused),
        failed = count(FieldStatus::Failed),
        duration_ms = elapsed.as_millis() as u64,
        "training summary"
    );
}

fn extract_values(
    field: Field,
    result: &ConsensusResult,
    offset: usize,
    count: usize,
) -> Vec<Option<String>> {
    (offset..offset + count)
        .map(|row| {
            result
                .consensus_label(row)
                .and_then(|index| field.category(index))
                .map(str::to_string)
        })
        .collect()
}

/// Original row followed by replicas whose first labelled cell cycles
/// through the other categories; features are tiled.
fn replicate_single_scan(
    field: Field,
    labels: &AnnotationMatrix,
    features: &FeatureMatrix,
) -> Result<(AnnotationMatrix, FeatureMatrix)> {
    let mut replicated_labels = labels.clone();
    let mut replicated_features = features.clone();
    let (Some(original), Some(vector)) = (labels.row(0), features.rows().first()) else {
        return Ok((replicated_labels, replicated_features));
    };
    let first_labelled = original.iter().position(Option::is_some);
    let num_classes = field.num_classes();

    for replica in 1..=SINGLE_SCAN_REPLICAS {
        let mut row = original.to_vec();
        if let Some(column) = first_labelled {
            row[column] = row[column].map(|class| (class + replica) % num_classes);
        }
        replicated_labels.push_row(row)?;
        replicated_features.push_row(vector.clone())?;
    }
    Ok((replicated_labels, replicated_features))
}

fn report_unknown_fields(batch: &ScanBatch) {
    let unknown: BTreeSet<&str> = batch
        .values()
        .flat_map(|annotators| annotators.values())
        .flat_map(|fields| fields.keys())
        .map(String::as_str)
        .filter(|name| Field::from_name(name).is_none() && !is_presence_field(name))
        .collect();
    if !unknown.is_empty() {
        debug!(fields = ?unknown, "ignoring unrecognised fields");
    }
}
