//! Incremental multi-field consensus for clinical scan annotations.
//!
//! Raw per-annotator values are encoded against a fixed schema, combined with
//! a cross-validated classifier into consensus labels with quality scores,
//! and persisted per field so later batches can reuse or extend history.

pub mod change;
pub mod config;
pub mod encoder;
pub mod error;
pub mod estimator;
pub mod features;
pub mod matrix;
pub mod model;
pub mod orchestrator;
pub mod schema;
pub mod store;
pub mod util;

pub use config::EngineConfig;
pub use error::{ConsensusError, Result};
pub use orchestrator::Orchestrator;
pub use schema::Field;
