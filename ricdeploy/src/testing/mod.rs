//! Test doubles for the orchestrator's collaborators.
//!
//! These are used by the crate's own tests and are public so that plans can
//! be exercised end to end without docker, kubectl or a cluster.

mod actions;
mod fakes;

pub use actions::{ExecutionLog, RecordingAction};
pub use fakes::{
    ExitsOn, FakeChartRegistry, FakeCommandRunner, FakeProcessTable, InMemoryBackend,
    ScriptedOperator,
};
