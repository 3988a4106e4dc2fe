//! Stage status and failure policy enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the runner does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the pipeline immediately.
    #[default]
    Fatal,
    /// Report the failure and ask the operator whether to continue.
    PromptContinue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::PromptContinue => write!(f, "prompt_continue"),
        }
    }
}

/// Final status of a stage in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Ok,
    /// Stage failed and halted the pipeline.
    Failed,
    /// Stage failed and the operator chose to continue.
    ContinuedAfterFailure,
    /// Stage never ran because the pipeline halted earlier.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
            Self::ContinuedAfterFailure => write!(f, "continued"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage's action actually ran.
    #[must_use]
    pub fn was_executed(&self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::ContinuedAfterFailure)
    }

    /// Returns true if the stage's action failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::ContinuedAfterFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_default_is_fatal() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Fatal);
    }

    #[test]
    fn test_failure_policy_serialize() {
        let json = serde_json::to_string(&FailurePolicy::PromptContinue).unwrap();
        assert_eq!(json, r#""prompt_continue""#);

        let policy: FailurePolicy = serde_json::from_str(r#""fatal""#).unwrap();
        assert_eq!(policy, FailurePolicy::Fatal);
    }

    #[test]
    fn test_stage_status_flags() {
        assert!(StageStatus::ContinuedAfterFailure.was_executed());
        assert!(!StageStatus::Skipped.was_executed());

        assert!(StageStatus::Failed.is_failure());
        assert!(!StageStatus::Ok.is_failure());
    }

    #[test]
    fn test_stage_status_serializes_final_states_only() {
        let json = serde_json::to_string(&StageStatus::ContinuedAfterFailure).unwrap();
        assert_eq!(json, r#""continued_after_failure""#);
        assert!(serde_json::from_str::<StageStatus>(r#""running""#).is_err());
        assert!(serde_json::from_str::<StageStatus>(r#""pending""#).is_err());
    }

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::ContinuedAfterFailure.to_string(), "continued");
        assert_eq!(StageStatus::Skipped.to_string(), "skipped");
    }
}
