//! Configuration generation.
//!
//! One [`ConfigTemplate`] plus the site registry yields every per-stage
//! configuration. [`ConfigGenerator::build`] is pure;
//! [`ConfigGenerator::materialize`] adds the submission precondition check;
//! [`ConfigGenerator::write`] renders the document next to the target's logs.

mod document;
mod generator;
mod template;

pub use document::{
    ConfigDocument, DeploymentSection, HeatmapsSection, LabelSchema, PreprocessingSection,
    StatisticsSection, TrainingSection,
};
pub use generator::{ConfigGenerator, RequiredInput, StageConfig};
pub use template::ConfigTemplate;
