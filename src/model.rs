use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::ChangeReport;
use crate::error::Result;
use crate::matrix::{AnnotationMatrix, FeatureMatrix};

/// `scan_id -> annotator_id -> field name -> raw value`.
pub type ScanBatch = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

pub type ScanConsensus = BTreeMap<String, Option<String>>;

pub type ScanConsensusRecord = BTreeMap<String, ScanConsensus>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Retrained,
    Reused,
    Skipped,
    Failed,
}

impl FieldStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrained => "retrained",
            Self::Reused => "reused",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldOutcome {
    pub status: FieldStatus,
    pub reused_existing: bool,
    pub changes: Option<ChangeReport>,
    pub examples: usize,
    pub annotators: usize,
    pub error: Option<String>,
}

impl FieldOutcome {
    pub fn failed(error: String) -> Self {
        Self {
            status: FieldStatus::Failed,
            reused_existing: false,
            changes: None,
            examples: 0,
            annotators: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub scan_ids: Vec<String>,
    pub count: usize,
    pub consensus_by_scan: ScanConsensusRecord,
    pub timestamp: String,
    pub fields: BTreeMap<String, FieldOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSummary {
    pub field: String,
    pub example_count: usize,
    pub annotator_count: usize,
    pub mean_consensus_quality: Option<f64>,
    pub min_consensus_quality: Option<f64>,
    pub max_consensus_quality: Option<f64>,
    pub mean_annotator_agreement: Option<f64>,
    pub mean_annotations_per_example: Option<f64>,
    pub mean_annotator_quality: Option<f64>,
    pub min_annotator_quality: Option<f64>,
    pub max_annotator_quality: Option<f64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub field: String,
    pub trained_at: String,
    pub examples: usize,
    pub annotators: usize,
    pub fold_count: usize,
    pub avg_consensus_quality: Option<f64>,
    pub duration_ms: u64,
    pub changes: Option<ChangeReport>,
}

/// Encoded matrices for one field; rows of `labels` and `features` align.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldTrainingSet {
    pub annotators: Vec<String>,
    pub labels: Vec<Vec<Option<usize>>>,
    pub features: Vec<Vec<f64>>,
}

impl FieldTrainingSet {
    pub fn into_matrices(self) -> Result<(AnnotationMatrix, FeatureMatrix)> {
        let dimensions = self.features.first().map(Vec::len).unwrap_or(0);
        Ok((
            AnnotationMatrix::from_rows(self.annotators, self.labels)?,
            FeatureMatrix::from_rows(dimensions, self.features)?,
        ))
    }
}

pub type TrainingDocument = BTreeMap<String, FieldTrainingSet>;
