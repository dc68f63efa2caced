//! Builds per-(target, stage) configurations from the template and registry.

use super::document::{
    ConfigDocument, DeploymentSection, HeatmapsSection, LabelSchema, PreprocessingSection,
    StatisticsSection, TrainingSection,
};
use super::template::ConfigTemplate;
use crate::core::{Stage, Target};
use crate::errors::{ConfigError, SiteflowError};
use crate::layout::StorageLayout;
use crate::registry::{Site, SiteRegistry, AGGREGATE_CODE};
use std::path::{Path, PathBuf};

/// An upstream path that must exist before a job may be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredInput {
    /// Human-readable description.
    pub what: &'static str,
    /// The path.
    pub path: PathBuf,
}

/// A fully resolved configuration for one (target, stage) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// The target.
    pub target: Target,
    /// The stage.
    pub stage: Stage,
    /// Document passed to the tool.
    pub document: ConfigDocument,
    /// Cache directory of the target namespace (configs and logs live here).
    pub cache_dir: PathBuf,
    /// Inputs checked by [`ConfigGenerator::materialize`].
    pub required_inputs: Vec<RequiredInput>,
}

impl StageConfig {
    /// Where the rendered document is written.
    #[must_use]
    pub fn document_path(&self) -> PathBuf {
        self.cache_dir.join("configs").join(format!("{}.yaml", self.stage))
    }

    /// Where tool output is appended.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.cache_dir.join("logs").join(format!("{}.log", self.stage))
    }
}

/// Pure function of (registry, layout, template, target, stage).
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    registry: SiteRegistry,
    layout: StorageLayout,
    template: ConfigTemplate,
}

impl ConfigGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new(registry: SiteRegistry, layout: StorageLayout, template: ConfigTemplate) -> Self {
        Self {
            registry,
            layout,
            template,
        }
    }

    /// The site registry.
    #[must_use]
    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// The storage layout.
    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// The shared template.
    #[must_use]
    pub fn template(&self) -> &ConfigTemplate {
        &self.template
    }

    /// Builds the configuration for `(target, stage)` without touching disk.
    ///
    /// # Errors
    ///
    /// `UnknownSite` for an unregistered site, `ScopeMismatch` when the stage
    /// does not run over this kind of target.
    pub fn build(&self, target: &Target, stage: Stage) -> Result<StageConfig, ConfigError> {
        let site = match target {
            Target::Site(code) => Some(self.registry.get(code.as_str()).ok_or_else(|| {
                ConfigError::UnknownSite {
                    site: code.to_string(),
                }
            })?),
            Target::Aggregate => None,
        };
        if !target.accepts(stage) {
            return Err(ConfigError::ScopeMismatch {
                target: target.to_string(),
                stage,
            });
        }

        Ok(match site {
            Some(site) => self.build_site(site, stage),
            None => self.build_aggregate(stage),
        })
    }

    /// Builds the configuration and checks that its upstream inputs exist.
    ///
    /// # Errors
    ///
    /// Everything [`build`](Self::build) returns, plus `MissingInput` for the
    /// first required path that does not exist.
    pub fn materialize(&self, target: &Target, stage: Stage) -> Result<StageConfig, ConfigError> {
        let config = self.build(target, stage)?;
        if let Some(missing) = config.required_inputs.iter().find(|i| !i.path.exists()) {
            return Err(ConfigError::MissingInput {
                target: target.to_string(),
                stage,
                what: missing.what.to_string(),
                path: missing.path.clone(),
            });
        }
        Ok(config)
    }

    /// Renders the document to `<cache>/configs/<stage>.yaml`.
    pub fn write(&self, config: &StageConfig) -> Result<PathBuf, SiteflowError> {
        let path = config.document_path();
        let rendered = config.document.render()?;
        crate::utils::write_atomic(&path, rendered.as_bytes())?;
        tracing::debug!(
            target_ns = %config.target,
            stage = %config.stage,
            path = %path.display(),
            "Wrote stage config"
        );
        Ok(path)
    }

    fn labels(&self) -> LabelSchema {
        LabelSchema {
            ground_truth_label: self.template.ground_truth_label.clone(),
            patient_label: self.template.patient_label.clone(),
            filename_label: self.template.filename_label.clone(),
            categories: self.template.categories.clone(),
        }
    }

    /// Trained checkpoint produced by the aggregate `train` stage.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.layout.aggregate_results_dir().join("train").join("model.ckpt")
    }

    /// Patient prediction tables produced by the aggregate `crossval` stage.
    #[must_use]
    pub fn prediction_csvs(&self) -> Vec<PathBuf> {
        let crossval = self.layout.aggregate_results_dir().join("crossval");
        (0..self.template.n_splits)
            .map(|fold| crossval.join(format!("fold-{fold}")).join("patient-preds.csv"))
            .collect()
    }

    fn build_site(&self, site: &Site, stage: Stage) -> StageConfig {
        let feature_dir = site.features_dir.join(&site.extractor);
        let mut document = ConfigDocument::default();
        let mut required = Vec::new();

        match stage {
            Stage::Prepare | Stage::Preprocess | Stage::Validate => {
                document.preprocessing = Some(PreprocessingSection {
                    output_dir: site.features_dir.clone(),
                    wsi_dir: site.raw_dir.clone(),
                    cache_dir: site.cache_dir.clone(),
                    extractor: site.extractor.clone(),
                    device: site.device.clone(),
                    max_workers: self.template.max_workers,
                    default_slide_mpp: self.template.default_slide_mpp,
                });
                if stage != Stage::Prepare {
                    required.push(input("raw slide directory", &site.raw_dir));
                }
            }
            Stage::Heatmap => {
                let checkpoint = self.checkpoint_path();
                document.deployment = Some(DeploymentSection {
                    output_dir: site.results_dir.join("deploy"),
                    checkpoint_paths: vec![checkpoint.clone()],
                    clini_table: site.clinical_table.clone(),
                    slide_table: site.slide_table.clone(),
                    feature_dir: feature_dir.clone(),
                    labels: self.labels(),
                    device: site.device.clone(),
                });
                document.heatmaps = Some(HeatmapsSection {
                    output_dir: site.results_dir.join("heatmaps"),
                    feature_dir: feature_dir.clone(),
                    wsi_dir: site.raw_dir.clone(),
                    checkpoint_path: checkpoint.clone(),
                    device: site.device.clone(),
                    topk: self.template.topk,
                    bottomk: self.template.bottomk,
                });
                required.push(input("trained model checkpoint", &checkpoint));
                required.push(input("site feature directory", &feature_dir));
                required.push(input("raw slide directory", &site.raw_dir));
            }
            // Unreachable through `build`, which rejects scope mismatches.
            Stage::Consolidate | Stage::Crossval | Stage::Train | Stage::Statistics => {}
        }

        StageConfig {
            target: Target::Site(site.code.clone()),
            stage,
            document,
            cache_dir: site.cache_dir.clone(),
            required_inputs: required,
        }
    }

    fn build_aggregate(&self, stage: Stage) -> StageConfig {
        let results = self.layout.aggregate_results_dir();
        let feature_dir = self.layout.aggregate_features_dir().join(&self.template.extractor);
        let clini_table = self.layout.clinical_table(AGGREGATE_CODE);
        let slide_table = self.layout.slide_table(AGGREGATE_CODE);
        let mut document = ConfigDocument::default();
        let mut required = Vec::new();

        let training = |output: &str, n_splits: Option<u32>| TrainingSection {
            output_dir: results.join(output),
            clini_table: clini_table.clone(),
            slide_table: slide_table.clone(),
            feature_dir: feature_dir.clone(),
            labels: self.labels(),
            n_splits,
        };
        let table_inputs = || {
            vec![
                input("consolidated clinical table", &clini_table),
                input("consolidated slide table", &slide_table),
                input("consolidated feature directory", &feature_dir),
            ]
        };

        match stage {
            Stage::Crossval => {
                document.crossval = Some(training("crossval", Some(self.template.n_splits)));
                required = table_inputs();
            }
            Stage::Train => {
                document.training = Some(training("train", None));
                required = table_inputs();
            }
            Stage::Statistics => {
                let pred_csvs = self.prediction_csvs();
                required = pred_csvs
                    .iter()
                    .map(|p| input("cross-validation predictions", p))
                    .collect();
                document.statistics = Some(StatisticsSection {
                    output_dir: results.join("statistics"),
                    pred_csvs,
                    ground_truth_label: self.template.ground_truth_label.clone(),
                    true_class: self.template.resolved_true_class().map(str::to_string),
                });
            }
            Stage::Consolidate
            | Stage::Prepare
            | Stage::Preprocess
            | Stage::Validate
            | Stage::Heatmap => {}
        }

        StageConfig {
            target: Target::Aggregate,
            stage,
            document,
            cache_dir: self.layout.cache_dir(AGGREGATE_CODE),
            required_inputs: required,
        }
    }
}

fn input(what: &'static str, path: &Path) -> RequiredInput {
    RequiredInput {
        what,
        path: path.to_path_buf(),
    }
}
