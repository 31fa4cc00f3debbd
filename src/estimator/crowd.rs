use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::matrix::AnnotationMatrix;

pub const CLIPPING_LOWER_BOUND: f64 = 1e-6;
const LIKELIHOOD_UPPER_BOUND: f64 = 1.0 - 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrowdWeights {
    pub model_weight: f64,
    pub annotator_weights: BTreeMap<String, f64>,
    pub likelihood: f64,
    pub num_classes: usize,
}

impl CrowdWeights {
    fn annotator_weight(&self, annotator: &str) -> f64 {
        if let Some(weight) = self.annotator_weights.get(annotator) {
            return *weight;
        }
        mean(self.annotator_weights.values().copied()).unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatorStats {
    pub annotator: String,
    pub quality: Option<f64>,
    pub agreement_with_consensus: Option<f64>,
    pub num_examples_labeled: usize,
}

#[derive(Debug, Clone)]
pub struct QualityOutcome {
    pub consensus_labels: Vec<usize>,
    pub consensus_quality: Vec<f64>,
    pub annotator_agreement: Vec<f64>,
    pub annotation_quality: Vec<Vec<Option<f64>>>,
    pub annotator_stats: Vec<AnnotatorStats>,
}

/// Derives model and annotator weights from agreement statistics.
///
/// Every row of `labels` must carry at least one annotation; `majority` and
/// `probs` are aligned with those rows.
pub fn estimate_weights(
    labels: &AnnotationMatrix,
    probs: &[Vec<f64>],
    majority: &[usize],
) -> CrowdWeights {
    let counts: Vec<usize> = (0..labels.num_rows())
        .map(|row| labels.annotation_count(row))
        .collect();
    let mut mask: Vec<usize> = (0..counts.len()).filter(|row| counts[*row] != 1).collect();
    if mask.is_empty() {
        mask = (0..counts.len()).collect();
    }

    let subset: Vec<usize> = mask.iter().map(|row| majority[*row]).collect();
    let most_likely_class_error = most_likely_class_error(&subset);

    // Annotators without co-annotated rows borrow the mean agreement.
    let agreement_with_others: Vec<Option<f64>> = (0..labels.num_annotators())
        .map(|column| agreement_with_other_annotators(labels, column))
        .collect();
    let fallback = mean(agreement_with_others.iter().flatten().copied()).unwrap_or(1.0);

    let annotator_weights = labels
        .annotators()
        .iter()
        .zip(agreement_with_others.iter())
        .map(|(annotator, agreement)| {
            let error = 1.0 - agreement.unwrap_or(fallback);
            let weight = (1.0 - error / most_likely_class_error).max(CLIPPING_LOWER_BOUND);
            (annotator.clone(), weight)
        })
        .collect();

    let model_misses = mask
        .iter()
        .filter(|row| argmax(&probs[**row]) != majority[**row])
        .count();
    let model_error = model_misses as f64 / mask.len() as f64;
    let mean_annotations = mean(counts.iter().map(|count| *count as f64)).unwrap_or(1.0);
    let model_weight = (1.0 - model_error / most_likely_class_error).max(CLIPPING_LOWER_BOUND)
        * mean_annotations.sqrt();

    let likelihood = mean(mask.iter().map(|row| {
        let agreeing = labels.rows()[*row]
            .iter()
            .filter(|cell| **cell == Some(majority[*row]))
            .count();
        agreeing as f64 / counts[*row].max(1) as f64
    }))
    .unwrap_or(1.0)
    .clamp(CLIPPING_LOWER_BOUND, LIKELIHOOD_UPPER_BOUND);

    let num_classes = probs.iter().map(Vec::len).max().unwrap_or(0);

    CrowdWeights {
        model_weight,
        annotator_weights,
        likelihood,
        num_classes,
    }
}

pub fn posterior(
    row: &[Option<usize>],
    annotators: &[String],
    probs: &[f64],
    weights: &CrowdWeights,
) -> Vec<f64> {
    let top_label = row.iter().flatten().copied().max().map(|label| label + 1);
    let num_classes = weights
        .num_classes
        .max(probs.len())
        .max(top_label.unwrap_or(0));
    let off_class = if num_classes > 1 {
        (1.0 - weights.likelihood) / (num_classes - 1) as f64
    } else {
        0.0
    };

    let mut totals: Vec<f64> = (0..num_classes)
        .map(|class| weights.model_weight * probs.get(class).copied().unwrap_or(0.0))
        .collect();
    let mut total_weight = weights.model_weight;

    for (cell, annotator) in row.iter().zip(annotators.iter()) {
        let Some(label) = cell else {
            continue;
        };
        let weight = weights.annotator_weight(annotator);
        total_weight += weight;
        for (class, total) in totals.iter_mut().enumerate() {
            let vote = if class == *label {
                weights.likelihood
            } else {
                off_class
            };
            *total += weight * vote;
        }
    }

    if total_weight <= 0.0 {
        return totals;
    }
    totals.into_iter().map(|value| value / total_weight).collect()
}

pub fn combine(labels: &AnnotationMatrix, probs: &[Vec<f64>], weights: &CrowdWeights) -> QualityOutcome {
    let annotators = labels.annotators();
    let posteriors: Vec<Vec<f64>> = labels
        .rows()
        .iter()
        .zip(probs.iter())
        .map(|(row, probs)| posterior(row, annotators, probs, weights))
        .collect();

    let consensus_labels: Vec<usize> = posteriors.iter().map(|row| argmax(row)).collect();
    let consensus_quality: Vec<f64> = posteriors
        .iter()
        .zip(consensus_labels.iter())
        .map(|(row, label)| row.get(*label).copied().unwrap_or(0.0))
        .collect();

    let annotator_agreement: Vec<f64> = labels
        .rows()
        .iter()
        .zip(consensus_labels.iter())
        .map(|(row, consensus)| {
            let annotated = row.iter().flatten().count();
            let agreeing = row.iter().flatten().filter(|label| *label == consensus).count();
            agreeing as f64 / annotated.max(1) as f64
        })
        .collect();

    let annotation_quality: Vec<Vec<Option<f64>>> = labels
        .rows()
        .iter()
        .zip(posteriors.iter())
        .map(|(row, posterior)| {
            row.iter()
                .map(|cell| cell.map(|label| posterior.get(label).copied().unwrap_or(0.0)))
                .collect()
        })
        .collect();

    let annotator_stats = annotator_stats(labels, &consensus_labels, &annotation_quality, weights);

    QualityOutcome {
        consensus_labels,
        consensus_quality,
        annotator_agreement,
        annotation_quality,
        annotator_stats,
    }
}

/// Per-annotator quality: a blend of mean per-annotation quality and
/// agreement with consensus on multi-annotated rows. The blend leans on the
/// model as its weight grows relative to the summed annotator weights.
///
/// Rows of `labels` are the annotated rows only, aligned with `consensus`.
pub(super) fn annotator_stats(
    labels: &AnnotationMatrix,
    consensus: &[usize],
    annotation_quality: &[Vec<Option<f64>>],
    weights: &CrowdWeights,
) -> Vec<AnnotatorStats> {
    let num_annotators = labels.num_annotators().max(1) as f64;
    let counts: Vec<usize> = (0..labels.num_rows())
        .map(|row| labels.annotation_count(row))
        .collect();
    let coverage = mean(counts.iter().map(|count| *count as f64)).unwrap_or(0.0) / num_annotators;
    let annotator_weight: f64 = labels
        .annotators()
        .iter()
        .map(|annotator| weights.annotator_weight(annotator))
        .sum();
    let denominator = weights.model_weight + annotator_weight * coverage;
    let model_share = if denominator > 0.0 {
        weights.model_weight / denominator
    } else {
        0.0
    };

    labels
        .annotators()
        .iter()
        .enumerate()
        .map(|(column, annotator)| {
            let labelled_quality = mean(annotation_quality.iter().filter_map(|row| row[column]));
            let agreement = mean(
                labels
                    .rows()
                    .iter()
                    .enumerate()
                    .filter(|(row, _)| counts[*row] > 1)
                    .filter_map(|(row, cells)| {
                        cells[column].map(|label| if label == consensus[row] { 1.0 } else { 0.0 })
                    }),
            );
            let quality = match (agreement, labelled_quality) {
                (Some(agreement), Some(labelled_quality)) => {
                    Some(model_share * labelled_quality + (1.0 - model_share) * agreement)
                }
                (_, labelled_quality) => labelled_quality,
            };
            AnnotatorStats {
                annotator: annotator.clone(),
                quality,
                agreement_with_consensus: agreement,
                num_examples_labeled: labels
                    .rows()
                    .iter()
                    .filter(|row| row[column].is_some())
                    .count(),
            }
        })
        .collect()
}

/// For one annotator, the mean share of co-annotators on shared rows who gave
/// the same label. `None` when the annotator never overlaps anyone.
fn agreement_with_other_annotators(labels: &AnnotationMatrix, column: usize) -> Option<f64> {
    mean(labels.rows().iter().filter_map(|row| {
        let label = row[column]?;
        let others = row.iter().flatten().count() - 1;
        if others == 0 {
            return None;
        }
        let agreeing = row.iter().flatten().filter(|other| **other == label).count() - 1;
        Some(agreeing as f64 / others as f64)
    }))
}

fn most_likely_class_error(labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return CLIPPING_LOWER_BOUND;
    }
    let width = labels.iter().copied().max().unwrap_or(0) + 1;
    let mut tally = vec![0_usize; width];
    for label in labels {
        tally[*label] += 1;
    }
    let most_common = tally.iter().copied().max().unwrap_or(0);
    let error = (labels.len() - most_common) as f64 / labels.len() as f64;
    error.max(CLIPPING_LOWER_BOUND)
}

pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0_usize;
    for (index, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = index;
        }
    }
    best
}

pub(crate) fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0_usize;
    for value in values {
        total += value;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}
