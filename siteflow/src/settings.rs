//! The `siteflow.toml` settings file.
//!
//! ```toml
//! root = "/lab/project"
//! table_index = 2
//!
//! [tool]
//! program = "stamp"
//! timeout_secs = 86400
//!
//! [template]
//! extractor = "ctranspath"
//! n_splits = 5
//!
//! [scheduler]
//! max_parallel = 4
//! [scheduler.retry]
//! max_attempts = 3
//!
//! [[sites]]
//! code = "msk"
//! [[sites]]
//! code = "luth"
//! device = "cuda:1"
//! ```
//!
//! Every table is optional; a missing file yields the built-in defaults.

use crate::config::{ConfigGenerator, ConfigTemplate};
use crate::errors::{ConfigError, RegistryError};
use crate::layout::StorageLayout;
use crate::registry::{SiteRegistry, SiteSpec};
use crate::scheduler::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file name.
pub const DEFAULT_SETTINGS_FILE: &str = "siteflow.toml";

/// How the external tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Executable name or path.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before `--config`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-job timeout; unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_program() -> String {
    "stamp".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl ToolSettings {
    /// The per-job timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Scheduler options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Concurrent job slots.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            retry: RetryConfig::default(),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Storage root.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Which `tables/<idx>` generation to read.
    #[serde(default = "default_table_index")]
    pub table_index: u32,
    /// External tool.
    #[serde(default)]
    pub tool: ToolSettings,
    /// Shared configuration template.
    #[serde(default)]
    pub template: ConfigTemplate,
    /// Scheduler options.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Participating sites; empty means the built-in list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sites: Vec<SiteSpec>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_table_index() -> u32 {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: default_root(),
            table_index: default_table_index(),
            tool: ToolSettings::default(),
            template: ConfigTemplate::default(),
            scheduler: SchedulerSettings::default(),
            sites: Vec::new(),
        }
    }
}

impl Settings {
    /// Parses settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::InvalidSettings(e.to_string()))
    }

    /// Loads settings from a file; a missing file yields defaults.
    ///
    /// A relative `root` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::InvalidSettings(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        let mut settings = Self::from_toml_str(&text)?;
        if settings.root.is_relative() {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                settings.root = dir.join(&settings.root);
            }
        }
        tracing::debug!(path = %path.display(), root = %settings.root.display(), "Loaded settings");
        Ok(settings)
    }

    /// Overrides the storage root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Storage layout for these settings.
    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.root, self.table_index)
    }

    /// Builds the site registry: the `[[sites]]` list, or the built-in one.
    pub fn registry(&self) -> Result<SiteRegistry, RegistryError> {
        let layout = self.layout();
        if self.sites.is_empty() {
            SiteRegistry::builtin(&layout, &self.template.extractor, &self.template.device)
        } else {
            SiteRegistry::new(
                &self.sites,
                &layout,
                &self.template.extractor,
                &self.template.device,
            )
        }
    }

    /// Builds the config generator.
    pub fn generator(&self) -> Result<ConfigGenerator, RegistryError> {
        Ok(ConfigGenerator::new(
            self.registry()?,
            self.layout(),
            self.template.clone(),
        ))
    }
}
