use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, Result};
use crate::matrix::FeatureMatrix;
use crate::schema::Field;

pub trait FeatureProvider: Send + Sync {
    fn features(&self, scan_id: &str, field: Field, dimensions: usize) -> Vec<f64>;
}

/// Deterministic standard-normal vectors keyed by `(seed, field, scan_id)`.
///
/// Carries no information about the scan itself, so the model term in the
/// consensus weighting stays close to chance.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderFeatureProvider {
    seed: u64,
}

impl PlaceholderFeatureProvider {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, scan_id: &str, field: Field) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(field.name().as_bytes());
        hasher.update([0_u8]);
        hasher.update(scan_id.as_bytes());
        let digest = hasher.finalize();

        let mut seed = [0_u8; 8];
        seed.copy_from_slice(&digest[..8]);
        StdRng::seed_from_u64(u64::from_le_bytes(seed))
    }
}

impl Default for PlaceholderFeatureProvider {
    fn default() -> Self {
        Self::new(42)
    }
}

impl FeatureProvider for PlaceholderFeatureProvider {
    fn features(&self, scan_id: &str, field: Field, dimensions: usize) -> Vec<f64> {
        let mut rng = self.rng_for(scan_id, field);
        (0..dimensions).map(|_| standard_normal(&mut rng)).collect()
    }
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

pub fn feature_matrix(
    provider: &dyn FeatureProvider,
    field: Field,
    scan_ids: &[String],
    dimensions: usize,
) -> Result<FeatureMatrix> {
    let mut matrix = FeatureMatrix::new(dimensions);
    for scan_id in scan_ids {
        let row = provider.features(scan_id, field, dimensions);
        if row.len() != dimensions {
            return Err(ConsensusError::Validation(format!(
                "feature provider returned {} values for scan {scan_id} ({field}); expected {dimensions}",
                row.len()
            )));
        }
        matrix.push_row(row)?;
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedWidth(usize);

    impl FeatureProvider for FixedWidth {
        fn features(&self, _scan_id: &str, _field: Field, _dimensions: usize) -> Vec<f64> {
            vec![0.0; self.0]
        }
    }

    #[test]
    fn placeholder_vectors_are_deterministic_per_scan_and_field() {
        let provider = PlaceholderFeatureProvider::default();
        let first = provider.features("scan42", Field::Size, 4);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|value| value.is_finite()));
        assert_eq!(first, provider.features("scan42", Field::Size, 4));
        assert_ne!(first, provider.features("scan43", Field::Size, 4));
        assert_ne!(first, provider.features("scan42", Field::TumorType, 4));
    }

    #[test]
    fn feature_matrix_rejects_wrong_width() {
        let scans = vec!["a".to_string(), "b".to_string()];
        let err = feature_matrix(&FixedWidth(3), Field::Size, &scans, 2)
            .expect_err("width mismatch must fail");
        assert!(matches!(err, ConsensusError::Validation(_)));

        let matrix = feature_matrix(&FixedWidth(2), Field::Size, &scans, 2).expect("matrix");
        assert_eq!(matrix.num_rows(), 2);
        assert_eq!(matrix.dimensions(), 2);
    }
}
