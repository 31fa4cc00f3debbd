use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationMatrix {
    annotators: Vec<String>,
    rows: Vec<Vec<Option<usize>>>,
}

impl AnnotationMatrix {
    pub fn new(annotators: Vec<String>) -> Self {
        Self {
            annotators,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(annotators: Vec<String>, rows: Vec<Vec<Option<usize>>>) -> Result<Self> {
        let mut matrix = Self::new(annotators);
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn push_row(&mut self, row: Vec<Option<usize>>) -> Result<()> {
        if row.len() != self.annotators.len() {
            return Err(ConsensusError::Validation(format!(
                "annotation row has {} cells but matrix has {} annotators",
                row.len(),
                self.annotators.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn annotators(&self) -> &[String] {
        &self.annotators
    }

    pub fn rows(&self) -> &[Vec<Option<usize>>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[Option<usize>]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_annotators(&self) -> usize {
        self.annotators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn annotation_count(&self, row: usize) -> usize {
        self.rows
            .get(row)
            .map(|cells| cells.iter().filter(|cell| cell.is_some()).count())
            .unwrap_or(0)
    }

    pub fn has_annotations(&self) -> bool {
        self.rows.iter().flatten().any(Option::is_some)
    }

    pub fn max_label(&self) -> Option<usize> {
        self.rows.iter().flatten().flatten().copied().max()
    }

    /// Returns a copy laid out on `columns`; cells for annotators this matrix
    /// never saw are missing.
    pub fn reindex(&self, columns: &[String]) -> Self {
        let positions: HashMap<&str, usize> = self
            .annotators
            .iter()
            .enumerate()
            .map(|(index, name)| (name.as_str(), index))
            .collect();

        let rows = self
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|name| {
                        positions
                            .get(name.as_str())
                            .and_then(|position| row[*position])
                    })
                    .collect()
            })
            .collect();

        Self {
            annotators: columns.to_vec(),
            rows,
        }
    }

    /// Appends `other` below `self` after reindexing both onto the sorted
    /// union of their annotators.
    pub fn concat(&self, other: &AnnotationMatrix) -> Self {
        let columns = union_annotators(&self.annotators, &other.annotators);
        let mut merged = self.reindex(&columns);
        merged.rows.extend(other.reindex(&columns).rows);
        merged
    }

    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            annotators: self.annotators.clone(),
            rows: indices.iter().map(|index| self.rows[*index].clone()).collect(),
        }
    }
}

pub fn union_annotators(left: &[String], right: &[String]) -> Vec<String> {
    left.iter()
        .chain(right.iter())
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    dimensions: usize,
    rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(dimensions: usize, rows: Vec<Vec<f64>>) -> Result<Self> {
        let mut matrix = Self::new(dimensions);
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    pub fn push_row(&mut self, row: Vec<f64>) -> Result<()> {
        if row.len() != self.dimensions {
            return Err(ConsensusError::Validation(format!(
                "feature row has {} values but matrix expects {}",
                row.len(),
                self.dimensions
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn concat(&self, other: &FeatureMatrix) -> Result<Self> {
        if self.dimensions != other.dimensions {
            return Err(ConsensusError::Validation(format!(
                "cannot stack features of width {} onto width {}",
                other.dimensions, self.dimensions
            )));
        }
        let mut merged = self.clone();
        merged.rows.extend(other.rows.iter().cloned());
        Ok(merged)
    }

    pub fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            dimensions: self.dimensions,
            rows: indices.iter().map(|index| self.rows[*index].clone()).collect(),
        }
    }
}
