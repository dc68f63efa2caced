//! Shared storage layout.
//!
//! Every path the orchestrator reads or writes hangs off one root:
//!
//! ```text
//! <root>/data/<site>/{raw,features,results,.cache}
//! <root>/data/all/{features,results,.cache}
//! <root>/tables/<idx>/<site>_{clinical,slide}_table.csv
//! <root>/.siteflow/state.json
//! ```

use crate::registry::AGGREGATE_CODE;
use std::path::{Path, PathBuf};

/// Resolves namespace paths relative to a single storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
    table_index: u32,
}

impl StorageLayout {
    /// Creates a layout rooted at `root`, reading tables from `tables/<table_index>`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, table_index: u32) -> Self {
        Self {
            root: root.into(),
            table_index,
        }
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the table stage-index.
    #[must_use]
    pub fn table_index(&self) -> u32 {
        self.table_index
    }

    /// `data/<namespace>`.
    #[must_use]
    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("data").join(namespace)
    }

    /// `data/<namespace>/raw`.
    #[must_use]
    pub fn raw_dir(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join("raw")
    }

    /// `data/<namespace>/features`.
    #[must_use]
    pub fn features_dir(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join("features")
    }

    /// `data/<namespace>/results`.
    #[must_use]
    pub fn results_dir(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join("results")
    }

    /// `data/<namespace>/.cache`.
    #[must_use]
    pub fn cache_dir(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join(".cache")
    }

    /// `tables/<idx>`.
    #[must_use]
    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("tables").join(self.table_index.to_string())
    }

    /// `tables/<idx>/<namespace>_clinical_table.csv`.
    #[must_use]
    pub fn clinical_table(&self, namespace: &str) -> PathBuf {
        self.tables_dir()
            .join(format!("{namespace}_clinical_table.csv"))
    }

    /// `tables/<idx>/<namespace>_slide_table.csv`.
    #[must_use]
    pub fn slide_table(&self, namespace: &str) -> PathBuf {
        self.tables_dir().join(format!("{namespace}_slide_table.csv"))
    }

    /// Features directory of the consolidated namespace.
    #[must_use]
    pub fn aggregate_features_dir(&self) -> PathBuf {
        self.features_dir(AGGREGATE_CODE)
    }

    /// Results directory of the consolidated namespace.
    #[must_use]
    pub fn aggregate_results_dir(&self) -> PathBuf {
        self.results_dir(AGGREGATE_CODE)
    }

    /// Location of the persisted scheduler state.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(".siteflow").join("state.json")
    }

    /// Lock file held by any command that writes the state file.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.state_file().with_extension("lock")
    }
}
