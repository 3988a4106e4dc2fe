//! Stage pipeline and health gates.

pub mod conditions;
pub mod health;
mod runner;
mod stage;

pub use conditions::{DescriptorListed, HttpReachable, PodRunning, PodsAbsent, ProcessAlive};
pub use health::{Condition, FnCondition, GateOutcome, HealthGate, HealthProbe};
pub use runner::{PipelineOutcome, PipelineReport, PipelineRunner, StageRecord};
pub use stage::{CommandAction, FnAction, Stage, StageAction};
