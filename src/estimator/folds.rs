use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

pub fn fold_count(requested: usize, labels: &[usize]) -> usize {
    let smallest = class_counts(labels).values().copied().min().unwrap_or(1);
    requested.min(smallest).max(2)
}

pub fn class_counts(labels: &[usize]) -> BTreeMap<usize, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(*label).or_insert(0) += 1;
    }
    counts
}

/// Stratified fold assignment: each class is shuffled with a seeded RNG and
/// dealt round-robin, continuing the deal across classes so folds stay
/// balanced in size.
pub fn stratified_assignment(labels: &[usize], folds: usize, seed: u64) -> Vec<usize> {
    let folds = folds.max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, label) in labels.iter().enumerate() {
        members.entry(*label).or_default().push(row);
    }

    let mut assignment = vec![0_usize; labels.len()];
    let mut dealt = 0_usize;
    for rows in members.values_mut() {
        rows.shuffle(&mut rng);
        for row in rows.iter() {
            assignment[*row] = dealt % folds;
            dealt += 1;
        }
    }
    assignment
}
