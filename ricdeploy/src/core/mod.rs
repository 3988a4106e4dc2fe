//! Core domain types shared across the orchestrator.

mod status;

pub use status::{FailurePolicy, StageStatus};
