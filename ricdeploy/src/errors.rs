//! Error types for the deployment orchestrator.
//!
//! The taxonomy follows how failures are handled by the pipeline: precondition
//! failures abort before anything is mutated, verification failures carry the
//! expected and actual values, external-tool failures only record success or
//! failure, and an operator abort halts forward progress like a fatal stage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for ricdeploy operations.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A precondition for running the pipeline does not hold.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Two digests that had to match did not.
    #[error("Checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was being compared (usually a file path or URL).
        subject: String,
        /// Digest of the source.
        expected: String,
        /// Digest of the copy.
        actual: String,
    },

    /// A resource was not found where it had to be.
    #[error("{kind} '{identifier}' not found after {action}")]
    ResourceMissing {
        /// Resource kind.
        kind: String,
        /// Resource identifier.
        identifier: String,
        /// The action that should have produced it.
        action: String,
    },

    /// A health gate exhausted its attempts.
    #[error("Health gate '{probe}' timed out after {attempts} attempts")]
    HealthTimeout {
        /// Probe name.
        probe: String,
        /// Number of polls performed.
        attempts: u32,
    },

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed ({}): {stderr}", exit_label(.code))]
    ExternalTool {
        /// The command line that was run.
        command: String,
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The chart registry or workload manager rejected a request.
    #[error("Registry request {operation} failed with HTTP {status}: {body}")]
    Registry {
        /// HTTP method and URL.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The operator answered "no" or gave no usable answer.
    #[error("Aborted by operator at '{step}'")]
    OperatorAbort {
        /// The step at which the operator declined.
        step: String,
    },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"))
}

impl DeployError {
    /// Creates a precondition error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an operator abort error.
    #[must_use]
    pub fn operator_abort(step: impl Into<String>) -> Self {
        Self::OperatorAbort { step: step.into() }
    }

    /// Creates a checksum mismatch error.
    #[must_use]
    pub fn checksum_mismatch(
        subject: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            subject: subject.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a resource missing error.
    #[must_use]
    pub fn resource_missing(
        kind: impl Into<String>,
        identifier: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::ResourceMissing {
            kind: kind.into(),
            identifier: identifier.into(),
            action: action.into(),
        }
    }

    /// Creates a health timeout error.
    #[must_use]
    pub fn health_timeout(probe: impl Into<String>, attempts: u32) -> Self {
        Self::HealthTimeout {
            probe: probe.into(),
            attempts,
        }
    }

    /// Returns the failure class this error belongs to.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Precondition(_) | Self::Config(_) => ErrorClass::Precondition,
            Self::ChecksumMismatch { .. }
            | Self::ResourceMissing { .. }
            | Self::HealthTimeout { .. } => ErrorClass::Verification,
            Self::ExternalTool { .. }
            | Self::Registry { .. }
            | Self::Http(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorClass::ExternalTool,
            Self::OperatorAbort { .. } => ErrorClass::OperatorAbort,
        }
    }

    /// Returns a stable diagnostic code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "DEPLOY-001-PRECONDITION",
            Self::Config(_) => "DEPLOY-002-CONFIG",
            Self::ChecksumMismatch { .. } => "DEPLOY-010-CHECKSUM",
            Self::ResourceMissing { .. } => "DEPLOY-011-RESOURCE-MISSING",
            Self::HealthTimeout { .. } => "DEPLOY-012-HEALTH-TIMEOUT",
            Self::ExternalTool { .. } => "DEPLOY-020-EXTERNAL-TOOL",
            Self::Registry { .. } => "DEPLOY-021-REGISTRY",
            Self::Http(_) => "DEPLOY-022-HTTP",
            Self::Io(_) => "DEPLOY-023-IO",
            Self::Serialization(_) => "DEPLOY-024-SERIALIZATION",
            Self::OperatorAbort { .. } => "DEPLOY-030-OPERATOR-ABORT",
        }
    }

    /// Returns true if this error is a deliberate operator abort.
    #[must_use]
    pub fn is_operator_abort(&self) -> bool {
        matches!(self, Self::OperatorAbort { .. })
    }

    /// Exit code of the failed external command, if that is what failed.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExternalTool { code, .. } => *code,
            _ => None,
        }
    }

    /// Builds the diagnostic record for this error.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        let mut info = ErrorInfo::new(self.code(), self.to_string()).with_class(self.class());
        match self {
            Self::ChecksumMismatch { expected, actual, .. } => {
                info = info
                    .with_context_entry("expected", expected)
                    .with_context_entry("actual", actual);
            }
            Self::HealthTimeout { attempts, .. } => {
                info = info.with_context_entry("attempts", attempts.to_string());
            }
            Self::ExternalTool { command, code, .. } => {
                info = info
                    .with_context_entry("command", command)
                    .with_context_entry("exit", exit_label(code));
            }
            _ => {}
        }
        info
    }
}

/// Coarse failure classes used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Environment or configuration is not fit to run.
    Precondition,
    /// A post-condition check failed.
    Verification,
    /// A dependent command or service failed.
    ExternalTool,
    /// The operator declined to continue.
    OperatorAbort,
}

/// Serializable diagnostic record attached to failed stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "DEPLOY-010-CHECKSUM").
    pub code: String,
    /// Human readable summary.
    pub summary: String,
    /// Failure class.
    pub class: Option<ErrorClass>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            class: None,
            context: HashMap::new(),
        }
    }

    /// Sets the failure class.
    #[must_use]
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
