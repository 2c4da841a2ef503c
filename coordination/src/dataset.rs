//! Dataset selection and built-in label vocabularies.
//!
//! Two smart-home activity datasets are supported. Each defines the label
//! values its committee predicts (indexed by [`LabelIndex`]) and a
//! human-readable phrase for each, used when asking a person for a label.

use serde::{Deserialize, Serialize};

use crate::committee::LabelIndex;

/// Error for an unrecognised dataset selector
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid dataset configuration: {0:?} (expected CASAS or ARAS)")]
pub struct UnknownDataset(pub String);

/// The dataset a session runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    /// CASAS Aruba single-resident activity annotations.
    #[serde(rename = "CASAS")]
    Casas,
    /// ARAS multi-resident house, activities numbered 1 to 27.
    #[serde(rename = "ARAS")]
    Aras,
}

/// CASAS model labels paired with their human phrasing.
const CASAS_LABELS: &[(&str, &str)] = &[
    ("Meal_Preparation", "preparing a meal"),
    ("Relax", "relaxing"),
    ("Eating", "eating"),
    ("Work", "working"),
    ("Sleeping", "sleeping"),
    ("Wash_Dishes", "washing the dishes"),
    ("Bed_to_Toilet", "getting up to use the toilet"),
    ("Enter_Home", "coming home"),
    ("Leave_Home", "leaving home"),
    ("Housekeeping", "doing housekeeping"),
    ("Respirate", "using the respirator"),
    ("Other", "something else"),
];

/// ARAS activity codes paired with their human phrasing.
const ARAS_LABELS: &[(&str, &str)] = &[
    ("1", "other"),
    ("2", "going out"),
    ("3", "preparing breakfast"),
    ("4", "having breakfast"),
    ("5", "preparing lunch"),
    ("6", "having lunch"),
    ("7", "preparing dinner"),
    ("8", "having dinner"),
    ("9", "washing dishes"),
    ("10", "having a snack"),
    ("11", "sleeping"),
    ("12", "watching TV"),
    ("13", "studying"),
    ("14", "having a shower"),
    ("15", "using the toilet"),
    ("16", "napping"),
    ("17", "using the internet"),
    ("18", "reading a book"),
    ("19", "doing laundry"),
    ("20", "shaving"),
    ("21", "brushing teeth"),
    ("22", "talking on the phone"),
    ("23", "listening to music"),
    ("24", "cleaning"),
    ("25", "having a conversation"),
    ("26", "having a guest"),
    ("27", "changing clothes"),
];

impl Dataset {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Casas => "CASAS",
            Self::Aras => "ARAS",
        }
    }

    /// `(model label, human phrase)` pairs in label-index order.
    pub fn vocabulary(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Casas => CASAS_LABELS,
            Self::Aras => ARAS_LABELS,
        }
    }

    pub fn classes(&self) -> usize {
        self.vocabulary().len()
    }

    /// Model label for `index`, if it is inside the vocabulary.
    pub fn label(&self, index: LabelIndex) -> Option<&'static str> {
        self.vocabulary().get(index).map(|(label, _)| *label)
    }
}

impl std::str::FromStr for Dataset {
    type Err = UnknownDataset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CASAS" => Ok(Self::Casas),
            "ARAS" => Ok(Self::Aras),
            _ => Err(UnknownDataset(s.to_string())),
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
