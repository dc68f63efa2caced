//! Pipeline stages and their declared prerequisite graph.

use crate::errors::{ConfigError, CycleDetectedError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// A named unit of pipeline work.
///
/// Variants are listed in declaration order; that order is the tie-break used
/// by the scheduler when several stages become ready at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Initializes the site workspace through the external tool.
    Prepare,
    /// Extracts slide features.
    Preprocess,
    /// Compares produced features against the raw slide manifest.
    Validate,
    /// Merges every site's features into the shared namespace.
    Consolidate,
    /// Cross-validated training on the consolidated dataset.
    Crossval,
    /// Full training on the consolidated dataset.
    Train,
    /// Statistics over cross-validation predictions.
    Statistics,
    /// Attention heatmaps for one site's slides.
    Heatmap,
}

/// Whether a stage runs once per site or once for the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// One job per registered site.
    Site,
    /// One job over the consolidated namespace.
    Aggregate,
}

/// A single prerequisite edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prerequisite {
    /// The named stage for the same site.
    SameSite(Stage),
    /// The named stage of the aggregate target.
    Aggregate(Stage),
    /// The named stage for every participating site (join barrier).
    EverySite(Stage),
}

impl Prerequisite {
    /// Returns the stage this edge points at.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::SameSite(s) | Self::Aggregate(s) | Self::EverySite(s) => *s,
        }
    }
}

impl Stage {
    /// Every stage in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Prepare,
        Self::Preprocess,
        Self::Validate,
        Self::Consolidate,
        Self::Crossval,
        Self::Train,
        Self::Statistics,
        Self::Heatmap,
    ];

    /// Returns the canonical stage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Preprocess => "preprocess",
            Self::Validate => "validate",
            Self::Consolidate => "consolidate",
            Self::Crossval => "crossval",
            Self::Train => "train",
            Self::Statistics => "statistics",
            Self::Heatmap => "heatmap",
        }
    }

    /// Position in declaration order.
    #[must_use]
    pub fn declaration_index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(Self::ALL.len())
    }

    /// Returns the stage scope.
    #[must_use]
    pub fn scope(&self) -> StageScope {
        match self {
            Self::Prepare | Self::Preprocess | Self::Validate | Self::Heatmap => StageScope::Site,
            Self::Consolidate | Self::Crossval | Self::Train | Self::Statistics => {
                StageScope::Aggregate
            }
        }
    }

    /// Returns the declared prerequisites.
    #[must_use]
    pub fn prerequisites(&self) -> &'static [Prerequisite] {
        use Prerequisite::{Aggregate, EverySite, SameSite};
        match self {
            Self::Prepare => &[],
            Self::Preprocess => &[SameSite(Self::Prepare)],
            Self::Validate => &[SameSite(Self::Preprocess)],
            Self::Consolidate => &[EverySite(Self::Preprocess), EverySite(Self::Validate)],
            Self::Crossval | Self::Train => &[Aggregate(Self::Consolidate)],
            Self::Statistics => &[Aggregate(Self::Crossval)],
            Self::Heatmap => &[SameSite(Self::Validate), Aggregate(Self::Train)],
        }
    }

    /// The external tool subcommand, or `None` for stages run in-process.
    #[must_use]
    pub fn tool_command(&self) -> Option<&'static str> {
        match self {
            Self::Prepare => Some("init"),
            Self::Preprocess => Some("preprocess"),
            Self::Crossval => Some("crossval"),
            Self::Train => Some("train"),
            Self::Statistics => Some("statistics"),
            Self::Heatmap => Some("heatmap"),
            Self::Validate | Self::Consolidate => None,
        }
    }

    /// Returns the stages that list `self` as a prerequisite.
    #[must_use]
    pub fn dependents(&self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|s| s.prerequisites().iter().any(|p| p.stage() == *self))
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownStage {
                name: s.to_string(),
            })
    }
}

/// Topologically orders the stage graph, failing with the cycle path if a
/// prerequisite loop is declared.
pub fn topological_order() -> Result<Vec<Stage>, CycleDetectedError> {
    let edges: HashMap<Stage, Vec<Stage>> = Stage::ALL
        .into_iter()
        .map(|s| (s, s.prerequisites().iter().map(Prerequisite::stage).collect()))
        .collect();

    fn visit(
        node: Stage,
        edges: &HashMap<Stage, Vec<Stage>>,
        visited: &mut HashSet<Stage>,
        path: &mut Vec<Stage>,
        order: &mut Vec<Stage>,
    ) -> Result<(), Vec<String>> {
        if let Some(start) = path.iter().position(|s| *s == node) {
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(node.to_string());
            return Err(cycle);
        }
        if visited.contains(&node) {
            return Ok(());
        }

        path.push(node);
        for dep in edges.get(&node).map(Vec::as_slice).unwrap_or_default() {
            visit(*dep, edges, visited, path, order)?;
        }
        path.pop();

        visited.insert(node);
        order.push(node);
        Ok(())
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for stage in Stage::ALL {
        visit(stage, &edges, &mut visited, &mut Vec::new(), &mut order)
            .map_err(CycleDetectedError::new)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_round_trips_through_from_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!(" Crossval ".parse::<Stage>().unwrap(), Stage::Crossval);
    }

    #[test]
    fn test_unknown_stage_is_config_error() {
        let err = "deploy".parse::<Stage>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStage { .. }));
    }

    #[test]
    fn test_stage_graph_is_acyclic() {
        let order = topological_order().unwrap();
        assert_eq!(order.len(), Stage::ALL.len());

        let pos = |s: Stage| order.iter().position(|o| *o == s).unwrap();
        for stage in Stage::ALL {
            for prereq in stage.prerequisites() {
                assert!(pos(prereq.stage()) < pos(stage), "{} before {}", prereq.stage(), stage);
            }
        }
    }

    #[test]
    fn test_consolidate_is_a_join_barrier() {
        assert!(Stage::Consolidate
            .prerequisites()
            .iter()
            .all(|p| matches!(p, Prerequisite::EverySite(_))));
        assert_eq!(Stage::Consolidate.scope(), StageScope::Aggregate);
    }

    #[test]
    fn test_in_process_stages_have_no_tool_command() {
        assert_eq!(Stage::Validate.tool_command(), None);
        assert_eq!(Stage::Consolidate.tool_command(), None);
        assert_eq!(Stage::Prepare.tool_command(), Some("init"));
        assert_eq!(Stage::Heatmap.tool_command(), Some("heatmap"));
    }

    #[test]
    fn test_dependents() {
        assert_eq!(Stage::Preprocess.dependents(), vec![Stage::Validate, Stage::Consolidate]);
        assert_eq!(Stage::Train.dependents(), vec![Stage::Heatmap]);
        assert!(Stage::Statistics.dependents().is_empty());
    }

    #[test]
    fn test_stage_serialize() {
        let json = serde_json::to_string(&Stage::Crossval).unwrap();
        assert_eq!(json, r#""crossval""#);
    }
}
