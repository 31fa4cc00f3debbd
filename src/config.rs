use serde::{Deserialize, Serialize};

use crate::change::{ChangeDetector, DEFAULT_RETRAIN_THRESHOLD};
use crate::estimator::{ClassifierKind, ClassifierParams, EstimatorConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    pub folds: usize,
    pub retrain_threshold: f64,
    pub seed: u64,
    /// Width used when a field is first initialised; later batches follow
    /// the persisted width.
    pub feature_dimensions: usize,
    pub classifier: ClassifierKind,
    pub max_iter: usize,
    pub l2_c: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let params = ClassifierParams::default();
        Self {
            folds: 5,
            retrain_threshold: DEFAULT_RETRAIN_THRESHOLD,
            seed: 42,
            feature_dimensions: 2,
            classifier: ClassifierKind::Logistic,
            max_iter: params.max_iter,
            l2_c: params.l2_c,
        }
    }
}

impl EngineConfig {
    pub fn estimator(&self) -> EstimatorConfig {
        EstimatorConfig {
            classifier: self.classifier,
            params: ClassifierParams {
                max_iter: self.max_iter,
                l2_c: self.l2_c,
            },
            seed: self.seed,
        }
    }

    pub fn change_detector(&self) -> ChangeDetector {
        ChangeDetector::new(self.retrain_threshold)
    }
}
