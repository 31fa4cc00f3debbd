use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

const LOCATION: &[&str] = &[
    "Frontal",
    "Parietal",
    "Temporal",
    "Occipital",
    "Cerebellum",
    "Brainstem",
];
const TUMOR_TYPE: &[&str] = &["Glioma", "Meningioma", "Metastasis", "Pituitary Adenoma", "Other"];
const GRADE: &[&str] = &["I", "II", "III", "IV", "Unknown"];
const SIZE: &[&str] = &["<10cm³", "10-50cm³", ">50cm³"];
const CONFIDENCE: &[&str] = &[
    "0-10%", "10-20%", "20-30%", "30-40%", "40-50%", "50-60%", "60-70%", "70-80%", "80-90%",
    "90-100%",
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "Tumor Location")]
    TumorLocation,
    #[serde(rename = "Tumor Type")]
    TumorType,
    #[serde(rename = "Tumor Grade")]
    TumorGrade,
    #[serde(rename = "Size")]
    Size,
    #[serde(rename = "Confidence")]
    Confidence,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::TumorLocation,
        Field::TumorType,
        Field::TumorGrade,
        Field::Size,
        Field::Confidence,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::TumorLocation => "Tumor Location",
            Self::TumorType => "Tumor Type",
            Self::TumorGrade => "Tumor Grade",
            Self::Size => "Size",
            Self::Confidence => "Confidence",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        let trimmed = name.trim();
        Self::ALL
            .into_iter()
            .find(|field| field.name().eq_ignore_ascii_case(trimmed))
    }

    pub fn categories(self) -> &'static [&'static str] {
        match self {
            Self::TumorLocation => LOCATION,
            Self::TumorType => TUMOR_TYPE,
            Self::TumorGrade => GRADE,
            Self::Size => SIZE,
            Self::Confidence => CONFIDENCE,
        }
    }

    pub fn num_classes(self) -> usize {
        self.categories().len()
    }

    pub fn category(self, index: usize) -> Option<&'static str> {
        self.categories().get(index).copied()
    }

    pub fn index_of(self, value: &str) -> Option<usize> {
        self.categories().iter().position(|category| *category == value)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = ConsensusError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Field::from_name(name).ok_or_else(|| ConsensusError::Schema(format!("unknown field: {name}")))
    }
}

pub fn is_presence_field(name: &str) -> bool {
    let normalized = name.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "tumor presence" | "presence")
}

/// Maps a confidence string onto its decile label.
///
/// Exact bin labels pass through. `"<number>%"` lands in `low <= value < high`,
/// except that 100 belongs to the last bin. Anything else is `None`.
pub fn bin_confidence(raw: &str) -> Option<&'static str> {
    let trimmed = raw.trim();
    if let Some(label) = CONFIDENCE.iter().find(|label| **label == trimmed) {
        return Some(label);
    }

    let number = trimmed.strip_suffix('%')?.trim();
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return None;
    }

    let decile = ((value / 10.0).floor() as usize).min(CONFIDENCE.len() - 1);
    CONFIDENCE.get(decile).copied()
}
