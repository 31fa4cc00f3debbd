use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, info};

use crate::error::{ConsensusError, Result};
use crate::estimator::{ConsensusResult, EstimatorState};
use crate::matrix::{AnnotationMatrix, FeatureMatrix, union_annotators};
use crate::model::TrainingRecord;
use crate::schema::Field;

use super::db_setup::{configure_connection, ensure_schema};
use super::{FieldState, FieldStore};

pub struct SqliteFieldStore {
    connection: Connection,
    path: Option<PathBuf>,
}

struct StateRow {
    annotators_json: String,
    feature_dim: i64,
    row_count: i64,
    estimator_json: String,
    result_json: String,
    updated_at: String,
}

impl SqliteFieldStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                ConsensusError::persistence(
                    format!("failed to create directory: {}", parent.display()),
                    err,
                )
            })?;
        }
        let connection = Connection::open(path).map_err(|err| {
            ConsensusError::persistence(format!("failed to open database: {}", path.display()), err)
        })?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        debug!(path = %path.display(), "opened field store");

        Ok(Self {
            connection,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn example_count(&self, field: Field) -> Result<usize> {
        let count: i64 = self.connection.query_row(
            "SELECT COUNT(*) FROM field_examples WHERE field = ?1",
            [field.name()],
            |row| row.get(0),
        )?;
        Ok(to_usize(count))
    }

    fn persist(
        &mut self,
        state: &FieldState,
        training: Option<&TrainingRecord>,
        rebuild: bool,
    ) -> Result<()> {
        if state.annotations.num_rows() != state.features.num_rows() {
            return Err(ConsensusError::Validation(format!(
                "refusing to persist {}: {} annotation rows vs {} feature rows",
                state.field,
                state.annotations.num_rows(),
                state.features.num_rows()
            )));
        }

        let tx = self.connection.transaction()?;
        let appended = append_examples(&tx, state, rebuild)?;

        tx.execute(
            "
            INSERT INTO field_states(
              field, annotators_json, feature_dim, row_count, estimator_json, result_json, updated_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(field) DO UPDATE SET
              annotators_json=excluded.annotators_json,
              feature_dim=excluded.feature_dim,
              row_count=excluded.row_count,
              estimator_json=excluded.estimator_json,
              result_json=excluded.result_json,
              updated_at=excluded.updated_at
            ",
            params![
                state.field.name(),
                serde_json::to_string(state.annotations.annotators())?,
                state.features.dimensions() as i64,
                state.annotations.num_rows() as i64,
                state.estimator.to_json()?,
                serde_json::to_string(&state.result)?,
                &state.updated_at,
            ],
        )?;

        if let Some(record) = training {
            let changes_json = record
                .changes
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "
                INSERT INTO training_history(
                  field, trained_at, examples, annotators, fold_count,
                  avg_consensus_quality, duration_ms, changes_json
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    &record.field,
                    &record.trained_at,
                    record.examples as i64,
                    record.annotators as i64,
                    record.fold_count as i64,
                    record.avg_consensus_quality,
                    record.duration_ms as i64,
                    changes_json,
                ],
            )?;
        }

        tx.commit()?;
        info!(
            field = %state.field,
            rows = state.annotations.num_rows(),
            appended,
            "persisted field state"
        );
        Ok(())
    }

    fn load_state_row(&self, field: Field) -> Result<Option<StateRow>> {
        let row = self
            .connection
            .query_row(
                "
                SELECT annotators_json, feature_dim, row_count, estimator_json, result_json, updated_at
                FROM field_states
                WHERE field = ?1
                ",
                [field.name()],
                |row| {
                    Ok(StateRow {
                        annotators_json: row.get(0)?,
                        feature_dim: row.get(1)?,
                        row_count: row.get(2)?,
                        estimator_json: row.get(3)?,
                        result_json: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn load_examples(
        &self,
        field: Field,
        row_count: usize,
    ) -> Result<Vec<(BTreeMap<String, usize>, Vec<f64>)>> {
        let mut statement = self.connection.prepare(
            "
            SELECT labels_json, features_json
            FROM field_examples
            WHERE field = ?1 AND row_idx < ?2
            ORDER BY row_idx
            ",
        )?;
        let raw = statement
            .query_map(params![field.name(), row_count as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(labels, features)| -> Result<(BTreeMap<String, usize>, Vec<f64>)> {
                Ok((serde_json::from_str(&labels)?, serde_json::from_str(&features)?))
            })
            .collect()
    }
}

impl FieldStore for SqliteFieldStore {
    fn load(&self, field: Field) -> Result<Option<FieldState>> {
        let Some(state) = self.load_state_row(field)? else {
            return Ok(None);
        };
        let row_count = to_usize(state.row_count);
        let examples = self.load_examples(field, row_count)?;
        if examples.len() != row_count {
            return Err(ConsensusError::Validation(format!(
                "field log for {field} holds {} rows but state expects {row_count}",
                examples.len()
            )));
        }

        let stored_annotators: Vec<String> = serde_json::from_str(&state.annotators_json)?;
        let logged: Vec<String> = examples
            .iter()
            .flat_map(|(labels, _)| labels.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let annotators = union_annotators(&stored_annotators, &logged);

        let mut annotations = AnnotationMatrix::new(annotators.clone());
        let mut features = FeatureMatrix::new(to_usize(state.feature_dim));
        for (labels, vector) in examples {
            annotations.push_row(
                annotators
                    .iter()
                    .map(|annotator| labels.get(annotator).copied())
                    .collect(),
            )?;
            features.push_row(vector)?;
        }

        let estimator = EstimatorState::from_json(&state.estimator_json)?;
        let result: ConsensusResult = serde_json::from_str(&state.result_json)?;

        debug!(
            field = %field,
            rows = annotations.num_rows(),
            annotators = annotations.num_annotators(),
            "loaded field state"
        );

        Ok(Some(FieldState {
            field,
            annotations,
            features,
            estimator,
            result,
            updated_at: state.updated_at,
        }))
    }

    fn save(&mut self, state: &FieldState, training: Option<&TrainingRecord>) -> Result<()> {
        self.persist(state, training, false)
    }

    fn replace(&mut self, state: &FieldState, training: Option<&TrainingRecord>) -> Result<()> {
        self.persist(state, training, true)
    }

    fn history(&self, field: Field) -> Result<Vec<TrainingRecord>> {
        let mut statement = self.connection.prepare(
            "
            SELECT field, trained_at, examples, annotators, fold_count,
                   avg_consensus_quality, duration_ms, changes_json
            FROM training_history
            WHERE field = ?1
            ORDER BY id
            ",
        )?;
        let rows = statement
            .query_map([field.name()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(field, trained_at, examples, annotators, fold_count, avg, duration_ms, changes)|
                 -> Result<TrainingRecord> {
                    Ok(TrainingRecord {
                        field,
                        trained_at,
                        examples: to_usize(examples),
                        annotators: to_usize(annotators),
                        fold_count: to_usize(fold_count),
                        avg_consensus_quality: avg,
                        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                        changes: changes.as_deref().map(serde_json::from_str).transpose()?,
                    })
                },
            )
            .collect()
    }

    fn fields(&self) -> Result<Vec<Field>> {
        let mut statement = self
            .connection
            .prepare("SELECT field FROM field_states ORDER BY field")?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut fields: Vec<Field> = names.iter().filter_map(|name| Field::from_name(name)).collect();
        fields.sort();
        Ok(fields)
    }
}

/// Appends rows past the persisted count. The log for the field is rebuilt
/// when asked to, or when the state shrank or its feature width changed.
fn append_examples(tx: &Transaction<'_>, state: &FieldState, rebuild: bool) -> Result<usize> {
    let field = state.field.name();
    let persisted: Option<(i64, i64)> = tx
        .query_row(
            "SELECT row_count, feature_dim FROM field_states WHERE field = ?1",
            [field],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let rows = state.annotations.num_rows();
    let mut start = persisted.map(|(count, _)| to_usize(count)).unwrap_or(0);
    let width_changed = persisted
        .map(|(_, dim)| to_usize(dim) != state.features.dimensions())
        .unwrap_or(false);
    if rebuild || start > rows || width_changed {
        debug!(field, persisted = start, rows, width_changed, rebuild, "rebuilding field log");
        tx.execute("DELETE FROM field_examples WHERE field = ?1", [field])?;
        start = 0;
    }
    tx.execute(
        "DELETE FROM field_examples WHERE field = ?1 AND row_idx >= ?2",
        params![field, start as i64],
    )?;

    let mut statement = tx.prepare(
        "
        INSERT INTO field_examples(field, row_idx, labels_json, features_json)
        VALUES(?1, ?2, ?3, ?4)
        ",
    )?;
    let annotators = state.annotations.annotators();
    for row_idx in start..rows {
        let labels: BTreeMap<&str, usize> = state.annotations.rows()[row_idx]
            .iter()
            .zip(annotators.iter())
            .filter_map(|(cell, annotator)| cell.map(|label| (annotator.as_str(), label)))
            .collect();
        statement.execute(params![
            field,
            row_idx as i64,
            serde_json::to_string(&labels)?,
            serde_json::to_string(&state.features.rows()[row_idx])?,
        ])?;
    }

    Ok(rows - start)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}
