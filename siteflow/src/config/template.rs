//! Shared configuration template.

use crate::tables::{DEFAULT_LABEL, FILENAME_COLUMN, PATIENT_COLUMN};
use serde::{Deserialize, Serialize};

/// Values every generated configuration shares.
///
/// Sites differ only in their paths and the extractor/device overrides held
/// by the registry; everything else comes from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    /// Default feature extractor.
    #[serde(default = "default_extractor")]
    pub extractor: String,
    /// Default compute device.
    #[serde(default = "default_device")]
    pub device: String,
    /// Ground-truth label column of the clinical table.
    #[serde(default = "default_label")]
    pub ground_truth_label: String,
    /// Patient id column.
    #[serde(default = "default_patient_label")]
    pub patient_label: String,
    /// Slide filename column.
    #[serde(default = "default_filename_label")]
    pub filename_label: String,
    /// Label values, in model output order.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Positive class for statistics; defaults to the first category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_class: Option<String>,
    /// Extraction worker count.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Microns per pixel assumed for slides lacking metadata.
    #[serde(default = "default_slide_mpp")]
    pub default_slide_mpp: f64,
    /// Cross-validation folds.
    #[serde(default = "default_n_splits")]
    pub n_splits: u32,
    /// Highest-scoring tiles rendered per heatmap.
    #[serde(default = "default_top_k")]
    pub topk: u32,
    /// Lowest-scoring tiles rendered per heatmap.
    #[serde(default = "default_top_k")]
    pub bottomk: u32,
}

fn default_extractor() -> String {
    "ctranspath".to_string()
}

fn default_device() -> String {
    "cuda".to_string()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_patient_label() -> String {
    PATIENT_COLUMN.to_string()
}

fn default_filename_label() -> String {
    FILENAME_COLUMN.to_string()
}

fn default_categories() -> Vec<String> {
    vec!["MSI-H".to_string(), "MSS".to_string()]
}

fn default_max_workers() -> u32 {
    8
}

fn default_slide_mpp() -> f64 {
    0.5
}

fn default_n_splits() -> u32 {
    5
}

fn default_top_k() -> u32 {
    8
}

impl Default for ConfigTemplate {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            device: default_device(),
            ground_truth_label: default_label(),
            patient_label: default_patient_label(),
            filename_label: default_filename_label(),
            categories: default_categories(),
            true_class: None,
            max_workers: default_max_workers(),
            default_slide_mpp: default_slide_mpp(),
            n_splits: default_n_splits(),
            topk: default_top_k(),
            bottomk: default_top_k(),
        }
    }
}

impl ConfigTemplate {
    /// Creates a template with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: impl Into<String>) -> Self {
        self.extractor = extractor.into();
        self
    }

    /// Sets the number of folds.
    #[must_use]
    pub fn with_n_splits(mut self, n_splits: u32) -> Self {
        self.n_splits = n_splits;
        self
    }

    /// Sets the categories.
    #[must_use]
    pub fn with_categories<S: Into<String>>(mut self, categories: impl IntoIterator<Item = S>) -> Self {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// The positive class used by statistics.
    #[must_use]
    pub fn resolved_true_class(&self) -> Option<&str> {
        self.true_class
            .as_deref()
            .or_else(|| self.categories.first().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let template: ConfigTemplate = toml::from_str("").unwrap();
        assert_eq!(template, ConfigTemplate::default());
        assert_eq!(template.ground_truth_label, "isMSIH");
        assert_eq!(template.resolved_true_class(), Some("MSI-H"));
    }

    #[test]
    fn test_partial_toml_override() {
        let template: ConfigTemplate =
            toml::from_str("n_splits = 3\ncategories = [\"MSIH\", \"nonMSIH\"]\ntrue_class = \"MSIH\"")
                .unwrap();
        assert_eq!(template.n_splits, 3);
        assert_eq!(template.categories, vec!["MSIH", "nonMSIH"]);
        assert_eq!(template.resolved_true_class(), Some("MSIH"));
        assert_eq!(template.max_workers, 8);
    }
}
