//! Label linker: translates between model labels and human phrasing.

use crate::dataset::Dataset;

/// Stateless lookup between a dataset's model labels and the phrases shown
/// to an annotator.
#[derive(Debug, Clone, Copy)]
pub struct LabelLinker {
    dataset: Dataset,
}

impl LabelLinker {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }

    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    /// Human phrase for a model label. Unknown labels pass through unchanged.
    pub fn to_human(&self, label: &str) -> String {
        self.dataset
            .vocabulary()
            .iter()
            .find(|(model, _)| *model == label)
            .map(|(_, human)| (*human).to_string())
            .unwrap_or_else(|| label.to_string())
    }

    /// Model label for an annotator's answer. Accepts either the human phrase
    /// or the model label itself, ignoring case and surrounding whitespace.
    pub fn from_human(&self, answer: &str) -> Option<String> {
        let answer = answer.trim();
        self.dataset
            .vocabulary()
            .iter()
            .find(|(model, human)| {
                human.eq_ignore_ascii_case(answer) || model.eq_ignore_ascii_case(answer)
            })
            .map(|(model, _)| (*model).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casas_round_trip() {
        let linker = LabelLinker::new(Dataset::Casas);
        assert_eq!(linker.to_human("Bed_to_Toilet"), "getting up to use the toilet");
        assert_eq!(
            linker.from_human("Getting up to use the toilet").as_deref(),
            Some("Bed_to_Toilet")
        );
    }

    #[test]
    fn test_aras_codes() {
        let linker = LabelLinker::new(Dataset::Aras);
        assert_eq!(linker.to_human("12"), "watching TV");
        assert_eq!(linker.from_human(" watching tv ").as_deref(), Some("12"));
        assert_eq!(linker.from_human("12").as_deref(), Some("12"));
    }

    #[test]
    fn test_unknown_labels() {
        let linker = LabelLinker::new(Dataset::Casas);
        assert_eq!(linker.to_human("Juggling"), "Juggling");
        assert_eq!(linker.from_human("juggling"), None);
    }
}
