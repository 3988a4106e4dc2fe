//! Stages and the actions they run.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::context::DeploymentContext;
use crate::core::FailurePolicy;
use crate::errors::DeployError;
use crate::exec::{run_checked, CommandRunner, CommandSpec};

/// The work a stage performs.
#[async_trait]
pub trait StageAction: Send + Sync + fmt::Debug {
    /// Runs the action. Discovered values are written to `ctx`.
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError>;
}

/// A named action with a failure policy.
#[derive(Clone)]
pub struct Stage {
    name: String,
    action: Arc<dyn StageAction>,
    policy: FailurePolicy,
}

impl Stage {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: impl Into<String>, action: Arc<dyn StageAction>, policy: FailurePolicy) -> Self {
        Self {
            name: name.into(),
            action,
            policy,
        }
    }

    /// A stage whose failure halts the pipeline.
    #[must_use]
    pub fn fatal(name: impl Into<String>, action: impl StageAction + 'static) -> Self {
        Self::new(name, Arc::new(action), FailurePolicy::Fatal)
    }

    /// A stage whose failure asks the operator whether to go on.
    #[must_use]
    pub fn prompt_continue(name: impl Into<String>, action: impl StageAction + 'static) -> Self {
        Self::new(name, Arc::new(action), FailurePolicy::PromptContinue)
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Failure policy.
    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// The action.
    #[must_use]
    pub fn action(&self) -> &dyn StageAction {
        self.action.as_ref()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("action", &self.action)
            .finish()
    }
}

/// Runs an external command; a non-zero exit fails the stage.
#[derive(Clone)]
pub struct CommandAction {
    runner: Arc<dyn CommandRunner>,
    command: CommandSpec,
}

impl CommandAction {
    /// Creates a command action.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, command: CommandSpec) -> Self {
        Self { runner, command }
    }

    /// The command run.
    #[must_use]
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAction")
            .field("command", &self.command.to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageAction for CommandAction {
    async fn execute(&self, _ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        run_checked(self.runner.as_ref(), &self.command).await?;
        Ok(())
    }
}

/// Wraps a synchronous closure over the context.
pub struct FnAction<F>
where
    F: Fn(&mut DeploymentContext) -> Result<(), DeployError> + Send + Sync,
{
    label: &'static str,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&mut DeploymentContext) -> Result<(), DeployError> + Send + Sync,
{
    /// Creates a closure action.
    pub fn new(label: &'static str, func: F) -> Self {
        Self { label, func }
    }
}

impl<F> fmt::Debug for FnAction<F>
where
    F: Fn(&mut DeploymentContext) -> Result<(), DeployError> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnAction").field(&self.label).finish()
    }
}

#[async_trait]
impl<F> StageAction for FnAction<F>
where
    F: Fn(&mut DeploymentContext) -> Result<(), DeployError> + Send + Sync,
{
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        (self.func)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::FakeCommandRunner;

    #[tokio::test]
    async fn test_command_action_fails_on_nonzero_exit() {
        let runner = Arc::new(FakeCommandRunner::new().respond(
            "apt-get install",
            CommandOutput::failure(100, "E: Unable to locate package"),
        ));
        let action = CommandAction::new(runner, CommandSpec::new("apt-get").args(["install", "-y", "nginx"]));
        let mut ctx = DeploymentContext::new("ts", "ricxapp");

        let err = action.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, DeployError::ExternalTool { code: Some(100), .. }));
    }

    #[tokio::test]
    async fn test_fn_action_writes_context() {
        let stage = Stage::fatal(
            "note",
            FnAction::new("note", |ctx: &mut DeploymentContext| {
                ctx.note("host", "10.0.0.7");
                Ok(())
            }),
        );
        let mut ctx = DeploymentContext::new("ts", "ricxapp");
        stage.action().execute(&mut ctx).await.unwrap();

        assert_eq!(stage.policy(), FailurePolicy::Fatal);
        assert_eq!(ctx.notes().get("host").map(String::as_str), Some("10.0.0.7"));
    }
}
