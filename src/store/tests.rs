use std::collections::BTreeMap;

use rusqlite::Connection;

use super::*;
use crate::error::ConsensusError;
use crate::estimator::ConsensusEstimator;
use crate::model::{ScanConsensus, ScanConsensusRecord};

fn annotations(annotators: &[&str], rows: usize) -> AnnotationMatrix {
    let width = annotators.len();
    AnnotationMatrix::from_rows(
        annotators.iter().map(|name| name.to_string()).collect(),
        (0..rows).map(|row| vec![Some(row % 3); width]).collect(),
    )
    .expect("annotations")
}

fn features(rows: usize) -> FeatureMatrix {
    FeatureMatrix::from_rows(2, (0..rows).map(|row| vec![row as f64, -(row as f64)]).collect())
        .expect("features")
}

fn trained_state(field: Field, annotators: &[&str], rows: usize) -> FieldState {
    let labels = annotations(annotators, rows);
    let features = features(rows);
    let run = ConsensusEstimator::default()
        .run(&labels, &features, 5)
        .expect("estimator run");
    FieldState {
        field,
        annotations: labels,
        features,
        estimator: run.state,
        result: run.result,
        updated_at: "2026-03-01T12:00:00Z".to_string(),
    }
}

fn training_record(state: &FieldState) -> TrainingRecord {
    TrainingRecord {
        field: state.field.name().to_string(),
        trained_at: state.updated_at.clone(),
        examples: state.annotations.num_rows(),
        annotators: state.annotations.num_annotators(),
        fold_count: state.estimator.training.fold_count,
        avg_consensus_quality: state.result.mean_consensus_quality(),
        duration_ms: 3,
        changes: None,
    }
}

#[test]
fn load_returns_none_for_untrained_field() {
    let store = SqliteFieldStore::open_in_memory().expect("store");
    assert!(store.load(Field::TumorType).expect("load").is_none());
    assert!(store.fields().expect("fields").is_empty());
}

#[test]
fn saved_state_loads_back_with_matrices_and_result() {
    let mut store = SqliteFieldStore::open_in_memory().expect("store");
    let state = trained_state(Field::TumorGrade, &["doc1", "doc2"], 6);
    store.save(&state, Some(&training_record(&state))).expect("save");

    let loaded = store
        .load(Field::TumorGrade)
        .expect("load")
        .expect("state present");
    assert_eq!(loaded.annotations, state.annotations);
    assert_eq!(loaded.features.num_rows(), 6);
    assert_eq!(loaded.features.dimensions(), 2);
    assert_eq!(loaded.result.consensus_labels, state.result.consensus_labels);
    assert_eq!(loaded.estimator.training, state.estimator.training);
    assert_eq!(loaded.updated_at, state.updated_at);
    assert_eq!(store.fields().expect("fields"), vec![Field::TumorGrade]);
}

#[test]
fn growing_state_appends_to_the_example_log() {
    let mut store = SqliteFieldStore::open_in_memory().expect("store");
    let first = trained_state(Field::Size, &["doc1"], 4);
    store.save(&first, Some(&training_record(&first))).expect("first save");
    assert_eq!(store.example_count(Field::Size).expect("count"), 4);

    let second = trained_state(Field::Size, &["doc1", "doc2"], 7);
    store.save(&second, Some(&training_record(&second))).expect("second save");
    assert_eq!(store.example_count(Field::Size).expect("count"), 7);

    let loaded = store.load(Field::Size).expect("load").expect("state present");
    assert_eq!(loaded.annotations.annotators(), &["doc1", "doc2"]);
    assert_eq!(loaded.annotations.num_rows(), 7);
    // Rows logged before doc2 existed keep doc2 missing.
    assert_eq!(loaded.annotations.rows()[0], vec![Some(0), None]);
    assert_eq!(loaded.annotations.rows()[5], vec![Some(2), Some(2)]);

    let history = store.history(Field::Size).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].examples, 4);
    assert_eq!(history[1].examples, 7);
    assert_eq!(history[1].annotators, 2);
}

#[test]
fn rejected_save_keeps_previous_state() {
    let mut store = SqliteFieldStore::open_in_memory().expect("store");
    let state = trained_state(Field::TumorLocation, &["doc1"], 3);
    store.save(&state, None).expect("save");

    let mut broken = trained_state(Field::TumorLocation, &["doc1"], 5);
    broken.features.truncate(2);
    let err = store.save(&broken, None).expect_err("misaligned save must fail");
    assert!(matches!(err, ConsensusError::Validation(_)));

    let loaded = store
        .load(Field::TumorLocation)
        .expect("load")
        .expect("state present");
    assert_eq!(loaded.annotations.num_rows(), 3);
    assert!(store.history(Field::TumorLocation).expect("history").is_empty());
}

#[test]
fn failure_inside_the_transaction_rolls_back_appended_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("store.sqlite");
    let mut store = SqliteFieldStore::open(&db_path).expect("store");
    let state = trained_state(Field::TumorType, &["doc1"], 3);
    store.save(&state, Some(&training_record(&state))).expect("first save");

    let connection = Connection::open(&db_path).expect("second connection");
    connection
        .execute_batch("DROP TABLE training_history")
        .expect("drop history table");

    let grown = trained_state(Field::TumorType, &["doc1", "doc2"], 6);
    let err = store
        .save(&grown, Some(&training_record(&grown)))
        .expect_err("history insert must fail");
    assert!(matches!(err, ConsensusError::Persistence { .. }));

    let loaded = store
        .load(Field::TumorType)
        .expect("load")
        .expect("state present");
    assert_eq!(loaded.annotations.num_rows(), 3);
    assert_eq!(loaded.annotations.annotators(), &["doc1"]);
    assert_eq!(store.example_count(Field::TumorType).expect("count"), 3);
}

#[test]
fn unknown_estimator_version_is_rejected_on_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("store.sqlite");
    let mut store = SqliteFieldStore::open(&db_path).expect("store");
    let state = trained_state(Field::Confidence, &["doc1"], 3);
    store.save(&state, None).expect("save");

    let mut future = state.estimator.clone();
    future.schema_version = 99;
    let raw = serde_json::to_string(&future).expect("serialize");
    let connection = Connection::open(&db_path).expect("second connection");
    connection
        .execute(
            "UPDATE field_states SET estimator_json = ?1 WHERE field = ?2",
            [raw.as_str(), Field::Confidence.name()],
        )
        .expect("tamper");

    let err = store.load(Field::Confidence).expect_err("version mismatch");
    assert!(matches!(
        err,
        ConsensusError::StateVersion {
            found: 99,
            expected: 1
        }
    ));
}

fn consensus(pairs: &[(&str, Option<&str>)]) -> ScanConsensus {
    pairs
        .iter()
        .map(|(field, value)| (field.to_string(), value.map(str::to_string)))
        .collect()
}

#[test]
fn record_store_merges_without_dropping_scans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ConsensusRecordStore::new(dir.path().join("nested").join("consensus_labels.json"));
    assert!(store.load().expect("empty load").is_empty());

    let mut first = ScanConsensusRecord::new();
    first.insert("scan1".to_string(), consensus(&[("Size", Some("<10cm³"))]));
    store.merge(&first).expect("first merge");

    let mut second = ScanConsensusRecord::new();
    second.insert("scan2".to_string(), consensus(&[("Size", None)]));
    let merged = store.merge(&second).expect("second merge");

    assert_eq!(merged.len(), 2);
    assert_eq!(store.lookup("scan1", "Size").expect("lookup").as_deref(), Some("<10cm³"));
    assert_eq!(store.lookup("scan2", "Size").expect("lookup"), None);
    assert_eq!(store.lookup("scan3", "Size").expect("lookup"), None);
    assert!(!store.path().with_extension("json.tmp").exists());
}

#[test]
fn record_store_overwrites_existing_scan_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ConsensusRecordStore::new(dir.path().join("consensus_labels.json"));

    let mut entries: BTreeMap<String, ScanConsensus> = BTreeMap::new();
    entries.insert("scan1".to_string(), consensus(&[("Tumor Grade", Some("II"))]));
    store.merge(&entries).expect("merge");
    entries.insert("scan1".to_string(), consensus(&[("Tumor Grade", Some("III"))]));
    store.merge(&entries).expect("merge");

    let record = store.load().expect("load");
    assert_eq!(record.len(), 1);
    assert_eq!(record["scan1"]["Tumor Grade"].as_deref(), Some("III"));
}

#[test]
fn replace_rewrites_the_example_log() {
    let mut store = SqliteFieldStore::open_in_memory().expect("store");
    let first = trained_state(Field::Size, &["doc1"], 4);
    store.save(&first, None).expect("first save");

    let mut second = trained_state(Field::Size, &["doc2"], 5);
    second.updated_at = "2026-03-02T12:00:00Z".to_string();
    store.replace(&second, None).expect("replace");

    let loaded = store.load(Field::Size).expect("load").expect("state present");
    assert_eq!(loaded.annotations.annotators(), &["doc2"]);
    assert_eq!(loaded.annotations, second.annotations);
    assert_eq!(loaded.updated_at, "2026-03-02T12:00:00Z");
    assert_eq!(store.example_count(Field::Size).expect("count"), 5);
}
