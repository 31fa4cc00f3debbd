use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::matrix::{AnnotationMatrix, FeatureMatrix};
use crate::schema::Field;
use crate::store::FieldState;

pub const DEFAULT_RETRAIN_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub new_example_count: usize,
    pub new_annotator_count: usize,
    pub relative_size_delta: f64,
    pub requires_retraining: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    threshold: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_RETRAIN_THRESHOLD)
    }
}

impl ChangeDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compares the new rows against the persisted state.
    ///
    /// Without prior state the field must be trained. An unseen annotator
    /// column, a feature width that differs from history, or a relative size
    /// delta at or above the threshold also force retraining.
    pub fn detect(
        &self,
        field: Field,
        new_labels: &AnnotationMatrix,
        new_features: &FeatureMatrix,
        prior: Option<&FieldState>,
    ) -> ChangeReport {
        let rows = new_labels.num_rows();
        self.assess(field, new_labels, new_features, prior, |prior_rows| {
            (rows, rows as f64 / prior_rows as f64)
        })
    }

    /// Like [`ChangeDetector::detect`], but `labels` is the complete history
    /// for the field, so only rows beyond the persisted count are new.
    pub fn detect_snapshot(
        &self,
        field: Field,
        labels: &AnnotationMatrix,
        features: &FeatureMatrix,
        prior: Option<&FieldState>,
    ) -> ChangeReport {
        let rows = labels.num_rows();
        self.assess(field, labels, features, prior, |prior_rows| {
            (
                rows.saturating_sub(prior_rows),
                (rows as f64 - prior_rows as f64) / prior_rows as f64,
            )
        })
    }

    fn assess(
        &self,
        field: Field,
        labels: &AnnotationMatrix,
        features: &FeatureMatrix,
        prior: Option<&FieldState>,
        growth: impl Fn(usize) -> (usize, f64),
    ) -> ChangeReport {
        let Some(prior) = prior else {
            return ChangeReport {
                new_example_count: labels.num_rows(),
                new_annotator_count: labels.num_annotators(),
                relative_size_delta: 0.0,
                requires_retraining: true,
            };
        };

        let new_annotator_count = labels
            .annotators()
            .iter()
            .filter(|annotator| !prior.annotations.annotators().contains(annotator))
            .count();
        let prior_rows = prior.annotations.num_rows();
        let (new_example_count, relative_size_delta) = if prior_rows == 0 {
            (labels.num_rows(), f64::INFINITY)
        } else {
            growth(prior_rows)
        };
        let feature_mismatch = features.dimensions() != prior.features.dimensions();

        let requires_retraining = new_annotator_count > 0
            || feature_mismatch
            || relative_size_delta.abs() >= self.threshold;

        debug!(
            field = %field,
            new_example_count,
            new_annotator_count,
            relative_size_delta,
            feature_mismatch,
            requires_retraining,
            "change detection"
        );

        ChangeReport {
            new_example_count,
            new_annotator_count,
            relative_size_delta,
            requires_retraining,
        }
    }
}
