use std::{collections::HashSet, fs, path::Path, sync::Arc};

use once_cell::sync::Lazy;

use crate::error::ServiceError;

/// Label order the deployed rice62 weights were trained with. Index
/// position is the class index of every classifier output.
const RICE62_LABELS: [&str; 62] = [
    "10_Lal_Aush", "11_Jirashail", "12_Gutisharna", "13_Red_Cargo", "14_Najirshail",
    "15_Katari_Polao", "16_Lal_Biroi", "17_Chinigura_Polao", "18_Amondhan", "19_Shorna5",
    "1_Subol_Lota", "20_Lal_Binni", "21_Arborio", "22_Turkish_Basmati", "23_Ipsala",
    "24_Jasmine", "25_Karacadag", "26_BD30", "27_BD33", "28_BD39", "29_BD49",
    "2_Bashmoti", "30_BD51", "31_BD52", "32_BD56", "33_BD57", "34_BD70", "35_BD72",
    "36_BD75", "37_BD76", "38_BD79", "39_BD85", "3_Ganjiya", "40_BD87", "41_BD91",
    "42_BD93", "43_BD95", "44_Binadhan7", "45_Binadhan8", "46_Binadhan10", "47_Binadhan11",
    "48_Binadhan12", "49_Binadhan14", "4_Shampakatari", "50_Binadhan16", "51_Binadhan17",
    "52_Binadhan19", "53_Binadhan21", "54_Binadhan23", "55_Binadhan24", "56_Binadhan25",
    "57_Binadhan26", "58_BR22", "59_BR23", "5_Katarivog", "60_BRRI67", "61_BRRI74",
    "62_BRRI102", "6_BR28", "7_BR29", "8_Paijam", "9_Bashful",
];

static RICE62: Lazy<Arc<Vocabulary>> = Lazy::new(|| {
    Arc::new(Vocabulary {
        labels: RICE62_LABELS.iter().map(|s| s.to_string()).collect(),
    })
});

/// Ordered, non-empty sequence of unique class labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    labels: Vec<String>,
}

impl Vocabulary {
    pub fn new<I, S>(labels: I) -> Result<Self, ServiceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(ServiceError::EmptyVocabulary);
        }
        let mut seen = HashSet::with_capacity(labels.len());
        for label in &labels {
            if label.trim().is_empty() {
                return Err(ServiceError::InvalidManifest(
                    "vocabulary contains a blank label".into(),
                ));
            }
            if !seen.insert(label.as_str()) {
                return Err(ServiceError::InvalidManifest(format!(
                    "duplicate label '{label}' in vocabulary"
                )));
            }
        }
        Ok(Self { labels })
    }

    /// Built-in 62-variety vocabulary.
    pub fn rice62() -> Arc<Vocabulary> {
        RICE62.clone()
    }

    /// Reads either a JSON array of strings or one label per line.
    pub fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        if raw.trim_start().starts_with('[') {
            let labels: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
                ServiceError::InvalidManifest(format!("invalid vocabulary file: {e}"))
            })?;
            Self::new(labels)
        } else {
            Self::new(
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            )
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_vocabulary_is_rejected() {
        let err = Vocabulary::new(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ServiceError::EmptyVocabulary));
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = Vocabulary::new(["A", "B", "A"]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidManifest(_)));
    }

    #[test]
    fn builtin_vocabulary_keeps_training_order() {
        let vocab = Vocabulary::rice62();
        assert_eq!(vocab.len(), 62);
        assert_eq!(vocab.label(0), Some("10_Lal_Aush"));
        assert_eq!(vocab.label(61), Some("9_Bashful"));
        assert_eq!(vocab.index_of("2_Bashmoti"), Some(21));
    }

    #[test]
    fn reads_json_and_line_files() {
        let mut json = tempfile::NamedTempFile::new().unwrap();
        write!(json, r#"["A", "B", "C"]"#).unwrap();
        let vocab = Vocabulary::from_path(json.path()).unwrap();
        assert_eq!(vocab.labels(), &["A", "B", "C"]);

        let mut lines = tempfile::NamedTempFile::new().unwrap();
        writeln!(lines, "Subol lota\n\nBashmoti\n").unwrap();
        let vocab = Vocabulary::from_path(lines.path()).unwrap();
        assert_eq!(vocab.labels(), &["Subol lota", "Bashmoti"]);
    }
}
