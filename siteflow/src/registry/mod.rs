//! Static registry of participating sites.
//!
//! The registry is built once at startup from a fixed list and never mutated.
//! It never discovers sites from storage: a directory under `data/` that is
//! not listed here does not take part in the run.

mod site;

pub use site::{Site, SiteCode, SiteSpec, AGGREGATE_CODE};

use crate::errors::RegistryError;
use crate::layout::StorageLayout;
use std::collections::HashSet;

/// Built-in site list, used when settings declare no `[[sites]]`.
///
/// Retrospective cohorts first, then the prospective collection sites.
pub const DEFAULT_SITES: &[&str] = &["msk", "oau", "oauthc", "luth", "uith", "lasuth"];

/// Ordered, immutable set of sites.
#[derive(Debug, Clone)]
pub struct SiteRegistry {
    sites: Vec<Site>,
}

impl SiteRegistry {
    /// Builds a registry from site specs.
    ///
    /// # Errors
    ///
    /// Fails on an empty list, a malformed or reserved code, or a duplicate code.
    pub fn new(
        specs: &[SiteSpec],
        layout: &StorageLayout,
        default_extractor: &str,
        default_device: &str,
    ) -> Result<Self, RegistryError> {
        if specs.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::new();
        let mut sites = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let site = Site::resolve(spec, index, layout, default_extractor, default_device)?;
            if !seen.insert(site.code.clone()) {
                return Err(RegistryError::DuplicateSite {
                    code: site.code.to_string(),
                });
            }
            sites.push(site);
        }

        Ok(Self { sites })
    }

    /// Builds the registry from [`DEFAULT_SITES`].
    pub fn builtin(
        layout: &StorageLayout,
        default_extractor: &str,
        default_device: &str,
    ) -> Result<Self, RegistryError> {
        let specs: Vec<SiteSpec> = DEFAULT_SITES.iter().map(|c| SiteSpec::new(*c)).collect();
        Self::new(&specs, layout, default_extractor, default_device)
    }

    /// Returns the sites in registry order.
    #[must_use]
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Returns the site codes in registry order.
    #[must_use]
    pub fn codes(&self) -> Vec<&SiteCode> {
        self.sites.iter().map(|s| &s.code).collect()
    }

    /// Looks up a site by code.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.code.as_str() == code)
    }

    /// Returns true if the code is registered.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.get(code).is_some()
    }

    /// Returns the registry position (batch array index) of a site.
    #[must_use]
    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.get(code).map(|s| s.index)
    }

    /// Number of registered sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Always false for a constructed registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
