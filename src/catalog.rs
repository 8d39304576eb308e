use std::{collections::BTreeMap, fs, path::Path};

use serde::Serialize;

use crate::{error::ServiceError, model::Vocabulary};

/// Shown when a predicted variety has no stored description.
pub const MISSING_INFO: &str = "No info available for this variety yet.";

#[derive(Debug, Clone, Serialize)]
pub struct VarietyInfo {
    pub variety_name: String,
    pub info: String,
}

/// Descriptive text per variety name. Absence is degraded output, not an error.
#[derive(Debug, Clone, Default)]
pub struct VarietyCatalog {
    entries: BTreeMap<String, String>,
}

impl VarietyCatalog {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// JSON object mapping variety name to text.
    pub fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Other(format!("invalid variety catalog: {e}")))?;
        Ok(Self { entries })
    }

    pub fn describe(&self, variety: &str) -> Option<&str> {
        self.entries
            .get(variety)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }

    pub fn describe_or_default(&self, variety: &str) -> &str {
        self.describe(variety).unwrap_or(MISSING_INFO)
    }

    /// Every vocabulary label with its text, ordered by variety name.
    pub fn list(&self, vocabulary: &Vocabulary) -> Vec<VarietyInfo> {
        let mut varieties: Vec<VarietyInfo> = vocabulary
            .labels()
            .iter()
            .map(|name| VarietyInfo {
                variety_name: name.clone(),
                info: self.describe_or_default(name).to_string(),
            })
            .collect();
        varieties.sort_by(|a, b| a.variety_name.cmp(&b.variety_name));
        varieties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_blank_text_fall_back() {
        let catalog = VarietyCatalog::from_entries([
            ("2_Bashmoti", "Long, aromatic grain."),
            ("6_BR28", "  "),
        ]);
        assert_eq!(catalog.describe_or_default("2_Bashmoti"), "Long, aromatic grain.");
        assert_eq!(catalog.describe_or_default("6_BR28"), MISSING_INFO);
        assert_eq!(catalog.describe("9_Bashful"), None);
    }

    #[test]
    fn lists_vocabulary_sorted_by_name() {
        let vocab = Vocabulary::new(["C", "A", "B"]).unwrap();
        let catalog = VarietyCatalog::from_entries([("A", "first")]);
        let listed = catalog.list(&vocab);
        let names: Vec<&str> = listed.iter().map(|v| v.variety_name.as_str()).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(listed[0].info, "first");
        assert_eq!(listed[1].info, MISSING_INFO);
    }

    #[test]
    fn malformed_catalog_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, r#"["not", "a", "map"]"#).unwrap();
        let err = VarietyCatalog::from_path(&path).unwrap_err();
        assert!(matches!(err, ServiceError::Other(_)));
        assert_ne!(err.kind(), "bad_request");
    }
}
