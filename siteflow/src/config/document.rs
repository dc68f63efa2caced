//! The configuration document handed to the external tool.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Label schema shared by the table-consuming sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSchema {
    /// Ground-truth label column.
    pub ground_truth_label: String,
    /// Patient id column.
    pub patient_label: String,
    /// Slide filename column.
    pub filename_label: String,
    /// Label values.
    pub categories: Vec<String>,
}

/// `preprocessing` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSection {
    /// Where feature files are written.
    pub output_dir: PathBuf,
    /// Raw slides.
    pub wsi_dir: PathBuf,
    /// Tile cache and tool logs.
    pub cache_dir: PathBuf,
    /// Feature extractor.
    pub extractor: String,
    /// Compute device.
    pub device: String,
    /// Extraction workers.
    pub max_workers: u32,
    /// Fallback microns per pixel.
    pub default_slide_mpp: f64,
}

/// `crossval` and `training` sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    /// Where models and predictions are written.
    pub output_dir: PathBuf,
    /// Clinical table.
    pub clini_table: PathBuf,
    /// Slide table.
    pub slide_table: PathBuf,
    /// Feature files.
    pub feature_dir: PathBuf,
    /// Column names and categories.
    #[serde(flatten)]
    pub labels: LabelSchema,
    /// Number of folds (cross-validation only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_splits: Option<u32>,
}

/// `deployment` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSection {
    /// Where predictions are written.
    pub output_dir: PathBuf,
    /// Trained model checkpoints.
    pub checkpoint_paths: Vec<PathBuf>,
    /// Clinical table of the deployment cohort.
    pub clini_table: PathBuf,
    /// Slide table of the deployment cohort.
    pub slide_table: PathBuf,
    /// Feature files of the deployment cohort.
    pub feature_dir: PathBuf,
    /// Column names and categories.
    #[serde(flatten)]
    pub labels: LabelSchema,
    /// Compute device.
    pub device: String,
}

/// `statistics` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSection {
    /// Where figures and tables are written.
    pub output_dir: PathBuf,
    /// Per-fold patient prediction tables.
    pub pred_csvs: Vec<PathBuf>,
    /// Ground-truth label column.
    pub ground_truth_label: String,
    /// Positive class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_class: Option<String>,
}

/// `heatmaps` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapsSection {
    /// Where heatmaps are written.
    pub output_dir: PathBuf,
    /// Feature files.
    pub feature_dir: PathBuf,
    /// Raw slides.
    pub wsi_dir: PathBuf,
    /// Trained model checkpoint.
    pub checkpoint_path: PathBuf,
    /// Compute device.
    pub device: String,
    /// Highest-scoring tiles to render.
    pub topk: u32,
    /// Lowest-scoring tiles to render.
    pub bottomk: u32,
}

/// A full configuration document. Absent sections are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Feature extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<PreprocessingSection>,
    /// Cross-validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossval: Option<TrainingSection>,
    /// Full training.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingSection>,
    /// Deployment of a trained model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSection>,
    /// Statistics over predictions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<StatisticsSection>,
    /// Attention heatmaps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmaps: Option<HeatmapsSection>,
}

impl ConfigDocument {
    /// Output directories written by this document's sections.
    #[must_use]
    pub fn output_dirs(&self) -> Vec<&PathBuf> {
        let mut dirs = Vec::new();
        if let Some(s) = &self.preprocessing {
            dirs.push(&s.output_dir);
        }
        if let Some(s) = &self.crossval {
            dirs.push(&s.output_dir);
        }
        if let Some(s) = &self.training {
            dirs.push(&s.output_dir);
        }
        if let Some(s) = &self.deployment {
            dirs.push(&s.output_dir);
        }
        if let Some(s) = &self.statistics {
            dirs.push(&s.output_dir);
        }
        if let Some(s) = &self.heatmaps {
            dirs.push(&s.output_dir);
        }
        dirs
    }

    /// Renders the document.
    ///
    /// Pretty-printed JSON is also valid YAML, so the output can be read by
    /// YAML-configured tools unchanged. Field order is fixed by the section
    /// types, so equal documents render to identical bytes.
    pub fn render(&self) -> Result<String, serde_json::Error> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }
}
