//! Site identity and resolved storage paths.

use crate::errors::RegistryError;
use crate::layout::StorageLayout;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Code reserved for the consolidated namespace.
pub const AGGREGATE_CODE: &str = "all";

#[allow(clippy::expect_used)]
static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_]{0,31}$").expect("static pattern"));

/// A validated site code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteCode(String);

impl SiteCode {
    /// Parses a site code.
    ///
    /// Codes are lowercase alphanumerics and underscores; `all` is reserved.
    pub fn new(code: impl Into<String>) -> Result<Self, RegistryError> {
        let code = code.into();
        if code == AGGREGATE_CODE {
            return Err(RegistryError::ReservedCode { code });
        }
        if !CODE_PATTERN.is_match(&code) {
            return Err(RegistryError::InvalidCode { code });
        }
        Ok(Self(code))
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl TryFrom<String> for SiteCode {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SiteCode> for String {
    fn from(code: SiteCode) -> Self {
        code.0
    }
}

/// Static description of a site, as listed in settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    /// Site code.
    pub code: String,
    /// Extractor override for this site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
    /// Device override for this site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl SiteSpec {
    /// Creates a spec with no overrides.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            extractor: None,
            device: None,
        }
    }

    /// Sets the device override.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Sets the extractor override.
    #[must_use]
    pub fn with_extractor(mut self, extractor: impl Into<String>) -> Self {
        self.extractor = Some(extractor.into());
        self
    }
}

/// A participating site with every path resolved against the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    /// Unique site code.
    pub code: SiteCode,
    /// Position in the registry; doubles as the batch array index.
    pub index: usize,
    /// `data/<site>`.
    pub root_dir: PathBuf,
    /// `data/<site>/raw`.
    pub raw_dir: PathBuf,
    /// `data/<site>/features`.
    pub features_dir: PathBuf,
    /// `data/<site>/results`.
    pub results_dir: PathBuf,
    /// `data/<site>/.cache`.
    pub cache_dir: PathBuf,
    /// `tables/<idx>/<site>_clinical_table.csv`.
    pub clinical_table: PathBuf,
    /// `tables/<idx>/<site>_slide_table.csv`.
    pub slide_table: PathBuf,
    /// Feature extractor identifier.
    pub extractor: String,
    /// Compute device selector.
    pub device: String,
}

impl Site {
    /// Resolves a site against a storage layout.
    pub fn resolve(
        spec: &SiteSpec,
        index: usize,
        layout: &StorageLayout,
        default_extractor: &str,
        default_device: &str,
    ) -> Result<Self, RegistryError> {
        let code = SiteCode::new(spec.code.clone())?;
        let name = code.as_str();
        Ok(Self {
            index,
            root_dir: layout.namespace_dir(name),
            raw_dir: layout.raw_dir(name),
            features_dir: layout.features_dir(name),
            results_dir: layout.results_dir(name),
            cache_dir: layout.cache_dir(name),
            clinical_table: layout.clinical_table(name),
            slide_table: layout.slide_table(name),
            extractor: spec
                .extractor
                .clone()
                .unwrap_or_else(|| default_extractor.to_string()),
            device: spec.device.clone().unwrap_or_else(|| default_device.to_string()),
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_code_validation() {
        assert!(SiteCode::new("msk").is_ok());
        assert!(SiteCode::new("retro_oau2").is_ok());
        assert!(matches!(SiteCode::new("MSK"), Err(RegistryError::InvalidCode { .. })));
        assert!(matches!(SiteCode::new(""), Err(RegistryError::InvalidCode { .. })));
        assert!(matches!(SiteCode::new("a/b"), Err(RegistryError::InvalidCode { .. })));
        assert!(matches!(SiteCode::new("all"), Err(RegistryError::ReservedCode { .. })));
    }

    #[test]
    fn test_site_code_serde() {
        let code = SiteCode::new("luth").unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), r#""luth""#);
        assert!(serde_json::from_str::<SiteCode>(r#""ALL""#).is_err());
    }

    #[test]
    fn test_site_resolve_applies_overrides() {
        let layout = StorageLayout::new("/proj", 2);
        let spec = SiteSpec::new("uith").with_device("cuda:1");
        let site = Site::resolve(&spec, 3, &layout, "ctranspath", "cuda").unwrap();

        assert_eq!(site.index, 3);
        assert_eq!(site.device, "cuda:1");
        assert_eq!(site.extractor, "ctranspath");
        assert_eq!(site.raw_dir, PathBuf::from("/proj/data/uith/raw"));
        assert_eq!(
            site.slide_table,
            PathBuf::from("/proj/tables/2/uith_slide_table.csv")
        );
    }
}
