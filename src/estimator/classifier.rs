use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

const MIN_SCALE: f64 = 1e-12;
const NB_VAR_SMOOTHING: f64 = 1e-9;

/// Probabilistic classifier seam used for cross-validated estimation.
///
/// `predict_proba` columns follow `classes()`, which is the sorted set of
/// labels seen by the last `fit`.
pub trait Classifier: Send {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[usize]) -> Result<()>;
    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>>;
    fn classes(&self) -> &[usize];
    fn to_state(&self) -> ClassifierState;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Logistic,
    NaiveBayes,
}

impl ClassifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logistic => "logistic",
            Self::NaiveBayes => "naive_bayes",
        }
    }

    pub fn build(self, params: &ClassifierParams) -> Box<dyn Classifier> {
        match self {
            Self::Logistic => Box::new(LogisticRegression::new(params.max_iter, params.l2_c)),
            Self::NaiveBayes => Box::new(GaussianNaiveBayes::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassifierParams {
    pub max_iter: usize,
    pub l2_c: f64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            l2_c: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierState {
    Logistic {
        classes: Vec<usize>,
        means: Vec<f64>,
        scales: Vec<f64>,
        weights: Vec<Vec<f64>>,
        intercepts: Vec<f64>,
    },
    NaiveBayes {
        classes: Vec<usize>,
        log_priors: Vec<f64>,
        means: Vec<Vec<f64>>,
        variances: Vec<Vec<f64>>,
    },
}

impl ClassifierState {
    pub fn kind(&self) -> ClassifierKind {
        match self {
            Self::Logistic { .. } => ClassifierKind::Logistic,
            Self::NaiveBayes { .. } => ClassifierKind::NaiveBayes,
        }
    }

    pub fn classes(&self) -> &[usize] {
        match self {
            Self::Logistic { classes, .. } | Self::NaiveBayes { classes, .. } => classes,
        }
    }

    pub fn into_classifier(self) -> Box<dyn Classifier> {
        match self {
            Self::Logistic {
                classes,
                means,
                scales,
                weights,
                intercepts,
            } => Box::new(LogisticRegression {
                max_iter: 0,
                l2_c: 1.0,
                classes,
                means,
                scales,
                weights,
                intercepts,
            }),
            Self::NaiveBayes {
                classes,
                log_priors,
                means,
                variances,
            } => Box::new(GaussianNaiveBayes {
                classes,
                log_priors,
                means,
                variances,
            }),
        }
    }
}

/// Multinomial logistic regression with an L2 penalty on the weights, fit by
/// full-batch gradient descent on standardized features.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    max_iter: usize,
    l2_c: f64,
    classes: Vec<usize>,
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

impl LogisticRegression {
    const LEARNING_RATE: f64 = 0.5;
    const TOLERANCE: f64 = 1e-6;

    pub fn new(max_iter: usize, l2_c: f64) -> Self {
        Self {
            max_iter,
            l2_c: if l2_c > 0.0 { l2_c } else { 1.0 },
            classes: Vec::new(),
            means: Vec::new(),
            scales: Vec::new(),
            weights: Vec::new(),
            intercepts: Vec::new(),
        }
    }

    fn standardize(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.means.iter().zip(self.scales.iter()))
            .map(|(value, (mean, scale))| (value - mean) / scale)
            .collect()
    }

    fn scores(&self, row: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(self.intercepts.iter())
            .map(|(weights, intercept)| {
                intercept
                    + weights
                        .iter()
                        .zip(row.iter())
                        .map(|(weight, value)| weight * value)
                        .sum::<f64>()
            })
            .collect()
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[usize]) -> Result<()> {
        check_training_shape(features, labels)?;

        let dims = features[0].len();
        let n = features.len() as f64;
        self.classes = sorted_classes(labels);
        let (means, variances) = column_moments(features, dims);
        self.means = means;
        // Constant columns are left unscaled.
        self.scales = variances
            .into_iter()
            .map(|variance| {
                let scale = variance.sqrt();
                if scale > MIN_SCALE { scale } else { 1.0 }
            })
            .collect();

        let num_classes = self.classes.len();
        self.weights = vec![vec![0.0; dims]; num_classes];
        self.intercepts = vec![0.0; num_classes];
        if num_classes < 2 {
            return Ok(());
        }

        let standardized: Vec<Vec<f64>> = features.iter().map(|row| self.standardize(row)).collect();
        let targets: Vec<usize> = labels
            .iter()
            .map(|label| class_position(&self.classes, *label))
            .collect();
        let penalty = 1.0 / (self.l2_c * n);

        for _ in 0..self.max_iter {
            let mut weight_grad = vec![vec![0.0; dims]; num_classes];
            let mut intercept_grad = vec![0.0; num_classes];

            for (row, target) in standardized.iter().zip(targets.iter()) {
                let probs = softmax(&self.scores(row));
                for class in 0..num_classes {
                    let residual = probs[class] - if class == *target { 1.0 } else { 0.0 };
                    intercept_grad[class] += residual / n;
                    for (grad, value) in weight_grad[class].iter_mut().zip(row.iter()) {
                        *grad += residual * value / n;
                    }
                }
            }

            let mut largest = 0.0_f64;
            for class in 0..num_classes {
                for (dim, grad) in weight_grad[class].iter_mut().enumerate() {
                    *grad += penalty * self.weights[class][dim];
                    largest = largest.max(grad.abs());
                    self.weights[class][dim] -= Self::LEARNING_RATE * *grad;
                }
                largest = largest.max(intercept_grad[class].abs());
                self.intercepts[class] -= Self::LEARNING_RATE * intercept_grad[class];
            }

            if largest < Self::TOLERANCE {
                break;
            }
        }

        Ok(())
    }

    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>> {
        features
            .iter()
            .map(|row| {
                if self.classes.len() < 2 {
                    return vec![1.0; self.classes.len()];
                }
                softmax(&self.scores(&self.standardize(row)))
            })
            .collect()
    }

    fn classes(&self) -> &[usize] {
        &self.classes
    }

    fn to_state(&self) -> ClassifierState {
        ClassifierState::Logistic {
            classes: self.classes.clone(),
            means: self.means.clone(),
            scales: self.scales.clone(),
            weights: self.weights.clone(),
            intercepts: self.intercepts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GaussianNaiveBayes {
    classes: Vec<usize>,
    log_priors: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

impl Classifier for GaussianNaiveBayes {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[usize]) -> Result<()> {
        check_training_shape(features, labels)?;

        let dims = features[0].len();
        self.classes = sorted_classes(labels);
        let (_, overall_variances) = column_moments(features, dims);
        let epsilon = NB_VAR_SMOOTHING * overall_variances.iter().copied().fold(0.0, f64::max);
        let epsilon = if epsilon > 0.0 { epsilon } else { NB_VAR_SMOOTHING };

        self.log_priors.clear();
        self.means.clear();
        self.variances.clear();
        for class in &self.classes {
            let members: Vec<Vec<f64>> = features
                .iter()
                .zip(labels.iter())
                .filter(|(_, label)| *label == class)
                .map(|(row, _)| row.clone())
                .collect();
            let (means, variances) = column_moments(&members, dims);
            self.log_priors
                .push((members.len() as f64 / features.len() as f64).ln());
            self.means.push(means);
            self.variances
                .push(variances.into_iter().map(|value| value + epsilon).collect());
        }

        Ok(())
    }

    fn predict_proba(&self, features: &[Vec<f64>]) -> Vec<Vec<f64>> {
        features
            .iter()
            .map(|row| {
                let joint: Vec<f64> = (0..self.classes.len())
                    .map(|class| {
                        let log_likelihood = row
                            .iter()
                            .zip(self.means[class].iter().zip(self.variances[class].iter()))
                            .map(|(value, (mean, variance))| {
                                -0.5 * (2.0 * std::f64::consts::PI * variance).ln()
                                    - (value - mean).powi(2) / (2.0 * variance)
                            })
                            .sum::<f64>();
                        self.log_priors[class] + log_likelihood
                    })
                    .collect();
                softmax(&joint)
            })
            .collect()
    }

    fn classes(&self) -> &[usize] {
        &self.classes
    }

    fn to_state(&self) -> ClassifierState {
        ClassifierState::NaiveBayes {
            classes: self.classes.clone(),
            log_priors: self.log_priors.clone(),
            means: self.means.clone(),
            variances: self.variances.clone(),
        }
    }
}

fn check_training_shape(features: &[Vec<f64>], labels: &[usize]) -> Result<()> {
    if features.is_empty() {
        return Err(ConsensusError::Validation(
            "cannot fit a classifier without examples".to_string(),
        ));
    }
    if features.len() != labels.len() {
        return Err(ConsensusError::Validation(format!(
            "classifier got {} feature rows but {} labels",
            features.len(),
            labels.len()
        )));
    }
    Ok(())
}

fn sorted_classes(labels: &[usize]) -> Vec<usize> {
    let mut classes = labels.to_vec();
    classes.sort_unstable();
    classes.dedup();
    classes
}

fn class_position(classes: &[usize], label: usize) -> usize {
    classes.binary_search(&label).unwrap_or(0)
}

fn column_moments(rows: &[Vec<f64>], dims: usize) -> (Vec<f64>, Vec<f64>) {
    let mut means = vec![0.0; dims];
    let mut variances = vec![0.0; dims];
    if rows.is_empty() {
        return (means, variances);
    }

    let n = rows.len() as f64;
    for row in rows {
        for (mean, value) in means.iter_mut().zip(row.iter()) {
            *mean += value / n;
        }
    }
    for row in rows {
        for ((variance, mean), value) in variances.iter_mut().zip(means.iter()).zip(row.iter()) {
            *variance += (value - mean).powi(2) / n;
        }
    }
    (means, variances)
}

pub(crate) fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|score| (score - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        let uniform = 1.0 / scores.len().max(1) as f64;
        return vec![uniform; scores.len()];
    }
    exps.into_iter().map(|value| value / total).collect()
}
