mod classifier;
mod crowd;
mod folds;
mod majority;

use std::collections::BTreeSet;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConsensusError, Result};
use crate::matrix::{AnnotationMatrix, FeatureMatrix};
use crate::util::now_utc_string;

pub use classifier::{
    Classifier, ClassifierKind, ClassifierParams, ClassifierState, GaussianNaiveBayes,
    LogisticRegression,
};
pub use crowd::{AnnotatorStats, CrowdWeights};
pub use folds::{fold_count, stratified_assignment};
pub use majority::{majority_of, majority_vote};

pub const ESTIMATOR_STATE_VERSION: u32 = 1;
pub const MISSING_CLASS_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub classifier: ClassifierKind,
    pub params: ClassifierParams,
    pub seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::Logistic,
            params: ClassifierParams::default(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub fold_count: usize,
    pub examples: usize,
    pub annotated_examples: usize,
    pub features: usize,
    pub single_class: bool,
    pub trained_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorState {
    pub schema_version: u32,
    pub classifier: ClassifierState,
    pub weights: CrowdWeights,
    pub training: TrainingMetadata,
}

impl EstimatorState {
    pub fn from_json(raw: &str) -> Result<Self> {
        let state: EstimatorState = serde_json::from_str(raw)?;
        if state.schema_version != ESTIMATOR_STATE_VERSION {
            return Err(ConsensusError::StateVersion {
                found: state.schema_version,
                expected: ESTIMATOR_STATE_VERSION,
            });
        }
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Output of one estimator run, aligned with the input rows.
///
/// Rows without any annotation have no majority vote and no consensus, but
/// still carry a model probability row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub annotators: Vec<String>,
    pub majority_vote_labels: Vec<Option<usize>>,
    pub pred_probs: Vec<Vec<f64>>,
    pub consensus_labels: Vec<Option<usize>>,
    pub consensus_quality: Vec<Option<f64>>,
    pub annotator_agreement: Vec<Option<f64>>,
    pub num_annotations: Vec<usize>,
    pub annotator_stats: Vec<AnnotatorStats>,
    pub annotation_quality: Vec<Vec<Option<f64>>>,
}

impl ConsensusResult {
    pub fn num_rows(&self) -> usize {
        self.consensus_labels.len()
    }

    pub fn consensus_label(&self, row: usize) -> Option<usize> {
        self.consensus_labels.get(row).copied().flatten()
    }

    pub fn truncate(&mut self, len: usize) {
        self.majority_vote_labels.truncate(len);
        self.pred_probs.truncate(len);
        self.consensus_labels.truncate(len);
        self.consensus_quality.truncate(len);
        self.annotator_agreement.truncate(len);
        self.num_annotations.truncate(len);
        self.annotation_quality.truncate(len);
    }

    /// Recomputes per-annotator statistics from the rows still present,
    /// e.g. after [`ConsensusResult::truncate`].
    pub fn refresh_annotator_stats(
        &mut self,
        labels: &AnnotationMatrix,
        weights: &CrowdWeights,
    ) -> Result<()> {
        if labels.num_rows() != self.num_rows() {
            return Err(ConsensusError::Validation(format!(
                "annotation matrix has {} rows but result has {}",
                labels.num_rows(),
                self.num_rows()
            )));
        }
        let annotated: Vec<usize> = (0..self.num_rows())
            .filter(|row| self.consensus_labels[*row].is_some())
            .collect();
        let consensus: Vec<usize> = annotated
            .iter()
            .filter_map(|row| self.consensus_labels[*row])
            .collect();
        let quality: Vec<Vec<Option<f64>>> = annotated
            .iter()
            .map(|row| self.annotation_quality[*row].clone())
            .collect();
        self.annotator_stats =
            crowd::annotator_stats(&labels.select_rows(&annotated), &consensus, &quality, weights);
        Ok(())
    }

    pub fn mean_consensus_quality(&self) -> Option<f64> {
        crowd::mean(self.consensus_quality.iter().flatten().copied())
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorRun {
    pub result: ConsensusResult,
    pub state: EstimatorState,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusEstimator {
    config: EstimatorConfig,
}

impl ConsensusEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn run(
        &self,
        labels: &AnnotationMatrix,
        features: &FeatureMatrix,
        fold_hint: usize,
    ) -> Result<EstimatorRun> {
        check_alignment(labels, features)?;
        let started = Instant::now();

        let majority = majority_vote(labels);
        let (annotated, baseline): (Vec<usize>, Vec<usize>) = majority
            .iter()
            .enumerate()
            .filter_map(|(row, label)| label.map(|label| (row, label)))
            .unzip();
        if annotated.is_empty() {
            return Err(ConsensusError::Validation(
                "annotation matrix has no annotated rows".to_string(),
            ));
        }

        let annotated_labels = labels.select_rows(&annotated);
        let annotated_features = features.select_rows(&annotated);
        let classes: Vec<usize> = baseline.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let width = labels
            .max_label()
            .unwrap_or(0)
            .max(classes.last().copied().unwrap_or(0))
            + 1;
        if width > classes.len() {
            debug!(
                trained_classes = classes.len(),
                width, "expanding probabilities to cover annotated classes"
            );
        }

        let single_class = classes.len() == 1;
        let (oof, folds) = if single_class {
            debug!(class = classes[0], "single baseline class; skipping cross-validation");
            (collapsed_probabilities(classes[0], width, baseline.len()), 0)
        } else {
            let folds = fold_count(fold_hint, &baseline);
            if folds != fold_hint {
                debug!(requested = fold_hint, folds, "adjusted cross-validation folds");
            }
            let oof = self.cross_validate(annotated_features.rows(), &baseline, &classes, width, folds)?;
            (oof, folds)
        };

        let mut final_model = self.config.classifier.build(&self.config.params);
        final_model.fit(annotated_features.rows(), &baseline)?;

        let weights = crowd::estimate_weights(&annotated_labels, &oof, &baseline);
        let outcome = crowd::combine(&annotated_labels, &oof, &weights);

        let mut pred_probs = final_model
            .predict_proba(features.rows())
            .into_iter()
            .map(|row| expand_probabilities(&row, final_model.classes(), &classes, width))
            .collect::<Vec<_>>();
        for (position, row) in annotated.iter().enumerate() {
            pred_probs[*row] = oof[position].clone();
        }

        let result = scatter_outcome(labels, majority, pred_probs, &annotated, outcome);
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            rows = labels.num_rows(),
            annotated = annotated.len(),
            annotators = labels.num_annotators(),
            classes = classes.len(),
            folds,
            model_weight = weights.model_weight,
            avg_quality = result.mean_consensus_quality().unwrap_or(0.0),
            duration_ms,
            "estimator run complete"
        );

        let state = EstimatorState {
            schema_version: ESTIMATOR_STATE_VERSION,
            classifier: final_model.to_state(),
            weights,
            training: TrainingMetadata {
                fold_count: folds,
                examples: labels.num_rows(),
                annotated_examples: annotated.len(),
                features: features.dimensions(),
                single_class,
                trained_at: now_utc_string(),
                duration_ms,
            },
        };

        Ok(EstimatorRun { result, state })
    }

    /// Out-of-fold probabilities; folds are fit in parallel and written back
    /// by row index, so completion order does not matter.
    fn cross_validate(
        &self,
        features: &[Vec<f64>],
        baseline: &[usize],
        classes: &[usize],
        width: usize,
        folds: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let assignment = stratified_assignment(baseline, folds, self.config.seed);
        let config = self.config;

        let per_fold: Vec<Result<Vec<(usize, Vec<f64>)>>> = (0..folds)
            .into_par_iter()
            .map(|fold| {
                let (test, train): (Vec<usize>, Vec<usize>) =
                    (0..baseline.len()).partition(|row| assignment[*row] == fold);
                if test.is_empty() || train.is_empty() {
                    return Ok(Vec::new());
                }

                let train_features: Vec<Vec<f64>> =
                    train.iter().map(|row| features[*row].clone()).collect();
                let train_labels: Vec<usize> = train.iter().map(|row| baseline[*row]).collect();
                let test_features: Vec<Vec<f64>> =
                    test.iter().map(|row| features[*row].clone()).collect();

                let mut model = config.classifier.build(&config.params);
                model.fit(&train_features, &train_labels)?;
                let probs = model.predict_proba(&test_features);

                Ok(test
                    .into_iter()
                    .zip(probs)
                    .map(|(row, probs)| {
                        (row, expand_probabilities(&probs, model.classes(), classes, width))
                    })
                    .collect())
            })
            .collect();

        let mut oof = vec![Vec::new(); baseline.len()];
        for fold in per_fold {
            for (row, probs) in fold? {
                oof[row] = probs;
            }
        }
        for row in oof.iter_mut().filter(|row| row.is_empty()) {
            *row = vec![1.0 / width as f64; width];
        }
        Ok(oof)
    }
}

pub fn score_with_state(
    state: &EstimatorState,
    labels: &AnnotationMatrix,
    features: &FeatureMatrix,
) -> Result<ConsensusResult> {
    check_alignment(labels, features)?;
    if features.dimensions() != state.training.features {
        return Err(ConsensusError::Validation(format!(
            "stored estimator expects {} features but got {}",
            state.training.features,
            features.dimensions()
        )));
    }

    let model = state.classifier.clone().into_classifier();
    let known = model.classes().to_vec();
    let width = state
        .weights
        .num_classes
        .max(labels.max_label().map(|label| label + 1).unwrap_or(0))
        .max(known.last().map(|label| label + 1).unwrap_or(0));

    let pred_probs: Vec<Vec<f64>> = model
        .predict_proba(features.rows())
        .into_iter()
        .map(|row| expand_probabilities(&row, &known, &known, width))
        .collect();

    let majority = majority_vote(labels);
    let annotated: Vec<usize> = majority
        .iter()
        .enumerate()
        .filter_map(|(row, label)| label.map(|_| row))
        .collect();
    let annotated_labels = labels.select_rows(&annotated);
    let annotated_probs: Vec<Vec<f64>> = annotated.iter().map(|row| pred_probs[*row].clone()).collect();
    let outcome = crowd::combine(&annotated_labels, &annotated_probs, &state.weights);

    Ok(scatter_outcome(labels, majority, pred_probs, &annotated, outcome))
}

fn check_alignment(labels: &AnnotationMatrix, features: &FeatureMatrix) -> Result<()> {
    if labels.num_rows() != features.num_rows() {
        return Err(ConsensusError::Validation(format!(
            "annotation matrix has {} rows but feature matrix has {}",
            labels.num_rows(),
            features.num_rows()
        )));
    }
    Ok(())
}

fn scatter_outcome(
    labels: &AnnotationMatrix,
    majority: Vec<Option<usize>>,
    pred_probs: Vec<Vec<f64>>,
    annotated: &[usize],
    outcome: crowd::QualityOutcome,
) -> ConsensusResult {
    let rows = labels.num_rows();
    let mut result = ConsensusResult {
        annotators: labels.annotators().to_vec(),
        majority_vote_labels: majority,
        pred_probs,
        consensus_labels: vec![None; rows],
        consensus_quality: vec![None; rows],
        annotator_agreement: vec![None; rows],
        num_annotations: (0..rows).map(|row| labels.annotation_count(row)).collect(),
        annotator_stats: outcome.annotator_stats,
        annotation_quality: vec![vec![None; labels.num_annotators()]; rows],
    };

    for (position, row) in annotated.iter().enumerate() {
        result.consensus_labels[*row] = Some(outcome.consensus_labels[position]);
        result.consensus_quality[*row] = Some(outcome.consensus_quality[position]);
        result.annotator_agreement[*row] = Some(outcome.annotator_agreement[position]);
        result.annotation_quality[*row] = outcome.annotation_quality[position].clone();
    }
    result
}

fn collapsed_probabilities(class: usize, width: usize, rows: usize) -> Vec<Vec<f64>> {
    let mut row = vec![MISSING_CLASS_EPSILON; width];
    row[class] = 1.0 - (width - 1) as f64 * MISSING_CLASS_EPSILON;
    normalize(&mut row);
    vec![row; rows]
}

/// Lays `probs` (ordered by `model_classes`) onto `width` columns.
///
/// Classes outside `known_classes` get a small epsilon; known classes the
/// model never saw stay at zero. Rows are renormalised to sum to one.
fn expand_probabilities(
    probs: &[f64],
    model_classes: &[usize],
    known_classes: &[usize],
    width: usize,
) -> Vec<f64> {
    let mut row = vec![0.0; width];
    for class in 0..width {
        if known_classes.binary_search(&class).is_err() {
            row[class] = MISSING_CLASS_EPSILON;
        }
    }
    for (class, value) in model_classes.iter().zip(probs.iter()) {
        if let Some(slot) = row.get_mut(*class) {
            *slot = *value;
        }
    }
    normalize(&mut row);
    row
}

fn normalize(row: &mut [f64]) {
    let total: f64 = row.iter().sum();
    if total > 0.0 && total.is_finite() {
        for value in row.iter_mut() {
            *value /= total;
        }
    } else if !row.is_empty() {
        let uniform = 1.0 / row.len() as f64;
        row.iter_mut().for_each(|value| *value = uniform);
    }
}
