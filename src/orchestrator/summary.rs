use crate::model::FieldSummary;
use crate::store::FieldState;

#[derive(Default)]
struct Spread {
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

fn spread(values: impl Iterator<Item = f64>) -> Spread {
    let mut total = 0.0;
    let mut count = 0_usize;
    let mut out = Spread::default();
    for value in values {
        total += value;
        count += 1;
        out.min = Some(out.min.map_or(value, |min| min.min(value)));
        out.max = Some(out.max.map_or(value, |max| max.max(value)));
    }
    if count > 0 {
        out.mean = Some(total / count as f64);
    }
    out
}

pub fn summarize_field(state: &FieldState) -> FieldSummary {
    let result = &state.result;
    let consensus = spread(result.consensus_quality.iter().flatten().copied());
    let agreement = spread(result.annotator_agreement.iter().flatten().copied());
    let annotations = spread(result.num_annotations.iter().map(|count| *count as f64));
    let annotators = spread(result.annotator_stats.iter().filter_map(|stats| stats.quality));

    FieldSummary {
        field: state.field.name().to_string(),
        example_count: state.annotations.num_rows(),
        annotator_count: state.annotations.num_annotators(),
        mean_consensus_quality: consensus.mean,
        min_consensus_quality: consensus.min,
        max_consensus_quality: consensus.max,
        mean_annotator_agreement: agreement.mean,
        mean_annotations_per_example: annotations.mean,
        mean_annotator_quality: annotators.mean,
        min_annotator_quality: annotators.min,
        max_annotator_quality: annotators.max,
        updated_at: state.updated_at.clone(),
    }
}
