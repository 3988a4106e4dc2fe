//! Stage actions that record their execution.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::context::DeploymentContext;
use crate::errors::DeployError;
use crate::pipeline::StageAction;

/// Shared, ordered record of which actions ran.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

type ErrorFactory = Arc<dyn Fn() -> DeployError + Send + Sync>;

/// Action appending its name to an [`ExecutionLog`], optionally failing.
#[derive(Clone)]
pub struct RecordingAction {
    name: String,
    log: ExecutionLog,
    failure: Option<ErrorFactory>,
}

impl ExecutionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// An action that records `name` and succeeds.
    #[must_use]
    pub fn action(&self, name: &str) -> RecordingAction {
        RecordingAction {
            name: name.to_string(),
            log: self.clone(),
            failure: None,
        }
    }

    /// An action that records `name` and fails like a command exiting 1.
    #[must_use]
    pub fn failing_action(&self, name: &str) -> RecordingAction {
        let command = format!("{name}.sh");
        self.action_failing_with(name, move || DeployError::ExternalTool {
            command: command.clone(),
            code: Some(1),
            stderr: "simulated failure".to_string(),
        })
    }

    /// An action that records `name` and fails with `error()`.
    #[must_use]
    pub fn action_failing_with<F>(&self, name: &str, error: F) -> RecordingAction
    where
        F: Fn() -> DeployError + Send + Sync + 'static,
    {
        RecordingAction {
            name: name.to_string(),
            log: self.clone(),
            failure: Some(Arc::new(error)),
        }
    }
}

impl fmt::Debug for RecordingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingAction")
            .field("name", &self.name)
            .field("fails", &self.failure.is_some())
            .finish()
    }
}

#[async_trait]
impl StageAction for RecordingAction {
    async fn execute(&self, _ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        self.log.entries.lock().push(self.name.clone());
        match &self.failure {
            Some(make_error) => Err(make_error()),
            None => Ok(()),
        }
    }
}
