mod db_setup;
mod field_store;
mod record_store;
#[cfg(test)]
mod tests;

use crate::error::Result;
use crate::estimator::{ConsensusResult, EstimatorState};
use crate::matrix::{AnnotationMatrix, FeatureMatrix};
use crate::model::TrainingRecord;
use crate::schema::Field;

pub use db_setup::DB_SCHEMA_VERSION;
pub use field_store::SqliteFieldStore;
pub use record_store::ConsensusRecordStore;

/// Everything persisted for one field after a successful estimator run.
#[derive(Debug, Clone)]
pub struct FieldState {
    pub field: Field,
    pub annotations: AnnotationMatrix,
    pub features: FeatureMatrix,
    pub estimator: EstimatorState,
    pub result: ConsensusResult,
    pub updated_at: String,
}

/// Load/save of per-field state. A `save` is all-or-nothing: a failed save
/// leaves the previously persisted state readable.
pub trait FieldStore {
    fn load(&self, field: Field) -> Result<Option<FieldState>>;

    fn save(&mut self, state: &FieldState, training: Option<&TrainingRecord>) -> Result<()>;

    /// Like `save`, but discards the field's logged examples first.
    fn replace(&mut self, state: &FieldState, training: Option<&TrainingRecord>) -> Result<()>;

    fn history(&self, field: Field) -> Result<Vec<TrainingRecord>>;

    fn fields(&self) -> Result<Vec<Field>>;
}
