//! Job targets: one site, or the aggregate.

use crate::core::{Stage, StageScope};
use crate::errors::RegistryError;
use crate::registry::{SiteCode, AGGREGATE_CODE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a job runs over.
///
/// Ordering places every site before the aggregate, so sorting a mixed list
/// of pairs keeps per-site work first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    /// A single site's namespace.
    Site(SiteCode),
    /// The consolidated namespace.
    Aggregate,
}

impl Target {
    /// Returns the namespace name (`all` for the aggregate).
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Site(code) => code.as_str(),
            Self::Aggregate => AGGREGATE_CODE,
        }
    }

    /// Returns the site code, if any.
    #[must_use]
    pub fn site(&self) -> Option<&SiteCode> {
        match self {
            Self::Site(code) => Some(code),
            Self::Aggregate => None,
        }
    }

    /// Returns true if `stage` may run over this target.
    #[must_use]
    pub fn accepts(&self, stage: Stage) -> bool {
        matches!(
            (self, stage.scope()),
            (Self::Site(_), StageScope::Site) | (Self::Aggregate, StageScope::Aggregate)
        )
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.namespace())
    }
}

impl FromStr for Target {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == AGGREGATE_CODE {
            Ok(Self::Aggregate)
        } else {
            SiteCode::new(s).map(Self::Site)
        }
    }
}

impl TryFrom<String> for Target {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.namespace().to_string()
    }
}

impl From<SiteCode> for Target {
    fn from(code: SiteCode) -> Self {
        Self::Site(code)
    }
}
