use std::collections::BTreeMap;

use tempfile::TempDir;

use super::*;
use crate::store::SqliteFieldStore;

fn orchestrator() -> (Orchestrator<SqliteFieldStore>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteFieldStore::open_in_memory().expect("store");
    let records = ConsensusRecordStore::new(dir.path().join("consensus_labels.json"));
    (Orchestrator::new(store, records, EngineConfig::default()), dir)
}

fn batch(entries: &[(&str, &str, &[(&str, &str)])]) -> ScanBatch {
    let mut batch = ScanBatch::new();
    for (scan_id, annotator, values) in entries {
        let fields: BTreeMap<String, String> = values
            .iter()
            .map(|(field, value)| (field.to_string(), value.to_string()))
            .collect();
        batch
            .entry(scan_id.to_string())
            .or_default()
            .insert(annotator.to_string(), fields);
    }
    batch
}

/// Twenty scans of tumor location labelled identically by two annotators.
fn location_history() -> ScanBatch {
    let mut batch = ScanBatch::new();
    for index in 0..20 {
        let location = Field::TumorLocation
            .category(index % Field::TumorLocation.num_classes())
            .expect("category");
        for annotator in ["doc1", "doc2"] {
            batch
                .entry(format!("scan{index:02}"))
                .or_default()
                .insert(
                    annotator.to_string(),
                    BTreeMap::from([("Tumor Location".to_string(), location.to_string())]),
                );
        }
    }
    batch
}

fn value<'a>(summary: &'a BatchSummary, scan_id: &str, field: &str) -> Option<&'a str> {
    summary.consensus_by_scan[scan_id][field].as_deref()
}

#[test]
fn single_unanimous_scan_resolves_every_field() {
    let (mut orchestrator, _dir) = orchestrator();
    let summary = orchestrator
        .add_scans(
            &batch(&[(
                "scan42",
                "doc1",
                &[
                    ("Tumor Location", "Frontal"),
                    ("Tumor Type", "Glioma"),
                    ("Tumor Grade", "II"),
                    ("Size", "<10cm³"),
                    ("Confidence", "42%"),
                    ("Tumor Presence", "Yes"),
                ],
            )]),
            false,
        )
        .expect("add scans");

    assert_eq!(summary.scan_ids, vec!["scan42".to_string()]);
    assert_eq!(summary.count, 1);
    assert_eq!(value(&summary, "scan42", "Tumor Location"), Some("Frontal"));
    assert_eq!(value(&summary, "scan42", "Tumor Type"), Some("Glioma"));
    assert_eq!(value(&summary, "scan42", "Tumor Grade"), Some("II"));
    assert_eq!(value(&summary, "scan42", "Size"), Some("<10cm³"));
    assert_eq!(value(&summary, "scan42", "Confidence"), Some("40-50%"));
    assert_eq!(summary.consensus_by_scan["scan42"].len(), 5);

    for field in Field::ALL {
        let outcome = &summary.fields[field.name()];
        assert_eq!(outcome.status, FieldStatus::Retrained, "{field}");

        let state = orchestrator
            .store()
            .load(field)
            .expect("load")
            .expect("state persisted");
        assert_eq!(state.annotations.num_rows(), 1, "{field}");
        assert_eq!(state.features.num_rows(), 1, "{field}");
        assert_eq!(state.result.num_rows(), 1, "{field}");
        let quality = state.result.consensus_quality[0].expect("quality");
        assert!(quality > 0.99, "{field} quality {quality}");
    }

    assert_eq!(
        orchestrator
            .lookup("scan42", Field::Confidence)
            .expect("lookup")
            .as_deref(),
        Some("40-50%")
    );
    let summary = orchestrator
        .field_summary(Field::TumorGrade)
        .expect("summary")
        .expect("trained field");
    assert_eq!(summary.example_count, 1);
    assert_eq!(summary.annotator_count, 1);
    assert!(summary.mean_consensus_quality.expect("mean quality") > 0.99);
}

#[test]
fn lone_first_scan_keeps_replicas_out_of_annotator_stats() {
    let (mut orchestrator, _dir) = orchestrator();
    let summary = orchestrator
        .add_scans(
            &batch(&[
                ("scan5", "doc1", &[("Tumor Grade", "II")]),
                ("scan5", "doc2", &[("Tumor Grade", "II")]),
            ]),
            false,
        )
        .expect("add scans");
    assert_eq!(value(&summary, "scan5", "Tumor Grade"), Some("II"));

    let state = orchestrator
        .store()
        .load(Field::TumorGrade)
        .expect("load")
        .expect("state persisted");
    assert_eq!(state.annotations.num_rows(), 1);
    assert_eq!(state.result.annotator_stats.len(), 2);
    for stats in &state.result.annotator_stats {
        assert_eq!(stats.num_examples_labeled, 1, "{}", stats.annotator);
        assert_eq!(stats.agreement_with_consensus, Some(1.0), "{}", stats.annotator);
    }
    assert_eq!(
        state.result.annotator_stats[0].quality,
        state.result.annotator_stats[1].quality
    );

    let field = orchestrator
        .field_summary(Field::TumorGrade)
        .expect("summary")
        .expect("trained field");
    assert_eq!(field.example_count, 1);
    assert_eq!(field.min_annotator_quality, field.max_annotator_quality);
}

#[test]
fn unparsable_confidence_resolves_to_null() {
    let (mut orchestrator, _dir) = orchestrator();
    let summary = orchestrator
        .add_scans(
            &batch(&[(
                "scan7",
                "doc1",
                &[("Tumor Type", "Meningioma"), ("Confidence", "high")],
            )]),
            false,
        )
        .expect("add scans");

    assert_eq!(value(&summary, "scan7", "Confidence"), None);
    assert_eq!(value(&summary, "scan7", "Tumor Type"), Some("Meningioma"));
    assert_eq!(summary.fields["Confidence"].status, FieldStatus::Skipped);

    let record = orchestrator.records().load().expect("record");
    assert_eq!(record["scan7"]["Confidence"], None);
    assert!(orchestrator.store().load(Field::Confidence).expect("load").is_none());
}

#[test]
fn sequential_disjoint_batches_both_land_in_the_record() {
    let (mut orchestrator, _dir) = orchestrator();
    orchestrator
        .add_scans(&batch(&[("scan1", "doc1", &[("Size", "<10cm³")])]), false)
        .expect("first batch");
    let second = orchestrator
        .add_scans(&batch(&[("scan2", "doc1", &[("Size", "10-50cm³")])]), false)
        .expect("second batch");

    assert_eq!(second.fields["Size"].status, FieldStatus::Retrained);
    assert_eq!(value(&second, "scan2", "Size"), Some("10-50cm³"));

    let record = orchestrator.records().load().expect("record");
    assert_eq!(record.len(), 2);
    assert_eq!(record["scan1"]["Size"].as_deref(), Some("<10cm³"));
    assert_eq!(record["scan2"]["Size"].as_deref(), Some("10-50cm³"));

    let state = orchestrator
        .store()
        .load(Field::Size)
        .expect("load")
        .expect("state");
    assert_eq!(state.annotations.num_rows(), 2);
    assert_eq!(orchestrator.training_history(Field::Size).expect("history").len(), 2);
}

#[test]
fn small_batch_from_known_annotators_reuses_without_growing_history() {
    let (mut orchestrator, _dir) = orchestrator();
    orchestrator
        .add_scans(&location_history(), false)
        .expect("history batch");

    let summary = orchestrator
        .add_scans(&batch(&[("scan99", "doc1", &[("Tumor Location", "Temporal")])]), false)
        .expect("small batch");

    let outcome = &summary.fields["Tumor Location"];
    assert_eq!(outcome.status, FieldStatus::Reused);
    assert!(outcome.reused_existing);
    let changes = outcome.changes.as_ref().expect("change report");
    assert_eq!(changes.new_annotator_count, 0);
    assert!((changes.relative_size_delta - 0.05).abs() < 1e-12);
    assert!(value(&summary, "scan99", "Tumor Location").is_some());

    let state = orchestrator
        .store()
        .load(Field::TumorLocation)
        .expect("load")
        .expect("state");
    assert_eq!(state.annotations.num_rows(), 20);
    assert_eq!(
        orchestrator
            .training_history(Field::TumorLocation)
            .expect("history")
            .len(),
        1
    );
    assert!(orchestrator.records().load().expect("record").contains_key("scan99"));
}

#[test]
fn forced_retrain_grows_history_even_for_small_batches() {
    let (mut orchestrator, _dir) = orchestrator();
    orchestrator
        .add_scans(&location_history(), false)
        .expect("history batch");

    let summary = orchestrator
        .add_scans(&batch(&[("scan99", "doc1", &[("Tumor Location", "Temporal")])]), true)
        .expect("forced batch");

    assert_eq!(summary.fields["Tumor Location"].status, FieldStatus::Retrained);
    let state = orchestrator
        .store()
        .load(Field::TumorLocation)
        .expect("load")
        .expect("state");
    assert_eq!(state.annotations.num_rows(), 21);
}

#[test]
fn unseen_annotator_forces_retraining() {
    let (mut orchestrator, _dir) = orchestrator();
    orchestrator
        .add_scans(&location_history(), false)
        .expect("history batch");

    let summary = orchestrator
        .add_scans(&batch(&[("scan99", "doc3", &[("Tumor Location", "Occipital")])]), false)
        .expect("new annotator batch");

    let outcome = &summary.fields["Tumor Location"];
    assert_eq!(outcome.status, FieldStatus::Retrained);
    assert!(!outcome.reused_existing);
    assert_eq!(outcome.changes.as_ref().expect("changes").new_annotator_count, 1);

    let state = orchestrator
        .store()
        .load(Field::TumorLocation)
        .expect("load")
        .expect("state");
    assert_eq!(state.annotations.annotators(), &["doc1", "doc2", "doc3"]);
    assert_eq!(state.annotations.num_rows(), 21);
    assert_eq!(state.annotations.rows()[0][2], None);
}

struct BrokenForSize;

impl FeatureProvider for BrokenForSize {
    fn features(&self, _scan_id: &str, field: Field, dimensions: usize) -> Vec<f64> {
        let width = if field == Field::Size { dimensions + 1 } else { dimensions };
        vec![0.25; width]
    }
}

#[test]
fn one_failing_field_does_not_abort_the_batch() {
    let (orchestrator, _dir) = orchestrator();
    let mut orchestrator = orchestrator.with_feature_provider(Box::new(BrokenForSize));

    let summary = orchestrator
        .add_scans(
            &batch(&[
                ("scan1", "doc1", &[("Size", "<10cm³"), ("Tumor Grade", "III")]),
                ("scan2", "doc1", &[("Size", ">50cm³"), ("Tumor Grade", "IV")]),
            ]),
            false,
        )
        .expect("add scans");

    let size = &summary.fields["Size"];
    assert_eq!(size.status, FieldStatus::Failed);
    assert!(size.error.as_deref().is_some_and(|error| error.contains("feature provider")));
    assert_eq!(value(&summary, "scan1", "Size"), None);

    assert_eq!(summary.fields["Tumor Grade"].status, FieldStatus::Retrained);
    assert_eq!(value(&summary, "scan1", "Tumor Grade"), Some("III"));
    assert_eq!(value(&summary, "scan2", "Tumor Grade"), Some("IV"));
    assert!(orchestrator.store().load(Field::Size).expect("load").is_none());
}

#[test]
fn empty_batch_touches_nothing() {
    let (mut orchestrator, _dir) = orchestrator();
    let summary = orchestrator
        .add_scans(&ScanBatch::new(), false)
        .expect("empty batch");
    assert_eq!(summary.count, 0);
    assert!(summary.fields.is_empty());
    assert!(!orchestrator.records().path().exists());
}

fn grade_history(rows: usize) -> (AnnotationMatrix, FeatureMatrix) {
    let labels = AnnotationMatrix::from_rows(
        vec!["doc1".to_string(), "doc2".to_string()],
        (0..rows).map(|row| vec![Some(row % 4), Some(row % 4)]).collect(),
    )
    .expect("labels");
    let features = FeatureMatrix::from_rows(
        2,
        (0..rows)
            .map(|row| vec![(row % 4) as f64 * 2.0, (row % 3) as f64 * 0.1])
            .collect(),
    )
    .expect("features");
    (labels, features)
}

fn training_inputs(
    entries: Vec<(&str, AnnotationMatrix, FeatureMatrix)>,
) -> (BTreeMap<String, AnnotationMatrix>, BTreeMap<String, FeatureMatrix>) {
    let mut labels = BTreeMap::new();
    let mut features = BTreeMap::new();
    for (name, field_labels, field_features) in entries {
        labels.insert(name.to_string(), field_labels);
        features.insert(name.to_string(), field_features);
    }
    (labels, features)
}

#[test]
fn bulk_training_seeds_fields_and_skips_presence() {
    let (mut orchestrator, _dir) = orchestrator();
    let (grade_labels, grade_features) = grade_history(20);
    let (presence_labels, presence_features) = grade_history(3);
    let (bogus_labels, bogus_features) = grade_history(3);
    let (labels, features) = training_inputs(vec![
        ("Tumor Grade", grade_labels, grade_features),
        ("Tumor Presence", presence_labels, presence_features),
        ("Tumor Colour", bogus_labels, bogus_features),
    ]);

    let outcomes = orchestrator
        .train_fields(&labels, &features, false)
        .expect("train fields");

    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes.contains_key("Tumor Presence"));
    assert_eq!(outcomes["Tumor Grade"].status, FieldStatus::Retrained);
    assert_eq!(outcomes["Tumor Grade"].examples, 20);
    assert_eq!(outcomes["Tumor Colour"].status, FieldStatus::Failed);
    assert!(
        outcomes["Tumor Colour"]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("unknown field"))
    );

    let state = orchestrator
        .store()
        .load(Field::TumorGrade)
        .expect("load")
        .expect("state persisted");
    assert_eq!(state.annotations.num_rows(), 20);
    assert_eq!(orchestrator.training_history(Field::TumorGrade).expect("history").len(), 1);
    assert!(!orchestrator.records().path().exists());
}

#[test]
fn bulk_training_reuses_until_the_snapshot_changes_enough() {
    let (mut orchestrator, _dir) = orchestrator();
    let (labels, features) = training_inputs(vec![{
        let (labels, features) = grade_history(20);
        ("Tumor Grade", labels, features)
    }]);
    orchestrator
        .train_fields(&labels, &features, false)
        .expect("seed");

    let (labels, features) = training_inputs(vec![{
        let (labels, features) = grade_history(21);
        ("Tumor Grade", labels, features)
    }]);
    let reused = orchestrator
        .train_fields(&labels, &features, false)
        .expect("small growth");
    let outcome = &reused["Tumor Grade"];
    assert_eq!(outcome.status, FieldStatus::Reused);
    assert_eq!(outcome.changes.as_ref().expect("changes").new_example_count, 1);
    assert_eq!(orchestrator.training_history(Field::TumorGrade).expect("history").len(), 1);

    let forced = orchestrator
        .train_fields(&labels, &features, true)
        .expect("forced");
    assert_eq!(forced["Tumor Grade"].status, FieldStatus::Retrained);
    assert_eq!(orchestrator.store().example_count(Field::TumorGrade).expect("count"), 21);

    let (labels, features) = training_inputs(vec![{
        let (labels, features) = grade_history(10);
        ("Tumor Grade", labels, features)
    }]);
    let shrunk = orchestrator
        .train_fields(&labels, &features, false)
        .expect("shrunk snapshot");
    assert_eq!(shrunk["Tumor Grade"].status, FieldStatus::Retrained);
    let state = orchestrator
        .store()
        .load(Field::TumorGrade)
        .expect("load")
        .expect("state");
    assert_eq!(state.annotations.num_rows(), 10);
    assert_eq!(orchestrator.training_history(Field::TumorGrade).expect("history").len(), 3);
}

#[test]
fn bulk_training_rejects_out_of_range_labels_and_missing_features() {
    let (mut orchestrator, _dir) = orchestrator();
    let wide = AnnotationMatrix::from_rows(
        vec!["doc1".to_string()],
        vec![vec![Some(0)], vec![Some(7)]],
    )
    .expect("labels");
    let (size_labels, _) = grade_history(4);

    let mut labels = BTreeMap::new();
    labels.insert("Tumor Grade".to_string(), wide);
    labels.insert("Size".to_string(), size_labels);
    let mut features = BTreeMap::new();
    features.insert(
        "Tumor Grade".to_string(),
        FeatureMatrix::from_rows(2, vec![vec![0.0, 0.0], vec![1.0, 1.0]]).expect("features"),
    );

    let outcomes = orchestrator
        .train_fields(&labels, &features, false)
        .expect("train fields");

    assert_eq!(outcomes["Tumor Grade"].status, FieldStatus::Failed);
    assert!(outcomes["Tumor Grade"].error.as_deref().is_some_and(|error| error.contains("out of range")));
    assert_eq!(outcomes["Size"].status, FieldStatus::Failed);
    assert!(outcomes["Size"].error.as_deref().is_some_and(|error| error.contains("no feature matrix")));
    assert!(orchestrator.store().fields().expect("fields").is_empty());
}
