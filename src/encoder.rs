use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::Result;
use crate::matrix::AnnotationMatrix;
use crate::model::ScanBatch;
use crate::schema::{Field, bin_confidence};

pub fn encode_value(field: Field, raw: &str) -> Option<usize> {
    match field {
        Field::Confidence => bin_confidence(raw).and_then(|label| field.index_of(label)),
        _ => field.index_of(raw),
    }
}

pub fn batch_annotators(batch: &ScanBatch) -> Vec<String> {
    batch
        .values()
        .flat_map(|annotators| annotators.keys().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

pub fn encode_batch(
    field: Field,
    batch: &ScanBatch,
    scan_ids: &[String],
) -> Result<AnnotationMatrix> {
    let annotators = batch_annotators(batch);
    let mut unresolved = 0_usize;

    let rows = scan_ids
        .iter()
        .map(|scan_id| {
            let by_annotator = batch.get(scan_id);
            annotators
                .iter()
                .map(|annotator| {
                    let raw = by_annotator
                        .and_then(|values| values.get(annotator))
                        .and_then(|fields| lookup_field(fields, field))?;
                    let encoded = encode_value(field, raw);
                    if encoded.is_none() {
                        unresolved += 1;
                    }
                    encoded
                })
                .collect::<Vec<Option<usize>>>()
        })
        .collect::<Vec<_>>();

    if unresolved > 0 {
        debug!(field = %field, unresolved, "annotations did not resolve to a category");
    }

    AnnotationMatrix::from_rows(annotators, rows)
}

fn lookup_field(fields: &BTreeMap<String, String>, field: Field) -> Option<&str> {
    if let Some(value) = fields.get(field.name()) {
        return Some(value.as_str());
    }
    fields
        .iter()
        .find(|(name, _)| Field::from_name(name) == Some(field))
        .map(|(_, value)| value.as_str())
}
