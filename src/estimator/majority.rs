use crate::matrix::AnnotationMatrix;

/// Most frequent label per row; ties go to the lowest class index and rows
/// without any annotation yield `None`.
pub fn majority_vote(labels: &AnnotationMatrix) -> Vec<Option<usize>> {
    labels.rows().iter().map(|row| majority_of(row)).collect()
}

pub fn majority_of(row: &[Option<usize>]) -> Option<usize> {
    let width = row.iter().flatten().copied().max()? + 1;
    let mut tally = vec![0_usize; width];
    for label in row.iter().flatten() {
        tally[*label] += 1;
    }

    let mut best = 0_usize;
    for (class, count) in tally.iter().enumerate() {
        if *count > tally[best] {
            best = class;
        }
    }
    Some(best)
}
