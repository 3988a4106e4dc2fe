//! External command execution.
//!
//! All shelling out (docker, kubectl, setup scripts) goes through the
//! [`CommandRunner`] seam so stage logic can be exercised without the tools
//! installed.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::DeployError;

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Bytes written to standard input.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Creates a spec for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Runs `script` through `sh -c`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feeds `bytes` to standard input.
    #[must_use]
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Returns true if the argument list contains `needle`.
    #[must_use]
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// A successful output with `stdout`.
    #[must_use]
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// A failed output with `code` and `stderr`.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true when the command exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output as text.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as trimmed text.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turns a non-zero exit into [`DeployError::ExternalTool`].
    pub fn check(self, spec: &CommandSpec) -> Result<Self, DeployError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DeployError::ExternalTool {
                command: spec.to_string(),
                code: self.code,
                stderr: self.stderr_str(),
            })
        }
    }
}

/// Runs external commands to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec`, capturing its output. Spawn failures are errors; a
    /// non-zero exit is reported in the output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError>;
}

/// Runs `spec` on `runner` and fails on a non-zero exit.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, DeployError> {
    runner.run(spec).await?.check(spec)
}

/// Runs commands on the local machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Creates a system runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        debug!(command = %spec, "Running command");

        let mut cmd = spec.to_tokio();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| DeployError::ExternalTool {
            command: spec.to_string(),
            code: None,
            stderr: format!("failed to spawn: {e}"),
        })?;

        if let (Some(bytes), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        debug!(command = %spec, code = ?result.code, "Command finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::shell("docker ps -a").arg("");
        assert_eq!(spec.to_string(), "sh -c 'docker ps -a' ''");
    }

    #[test]
    fn test_check_maps_failure() {
        let spec = CommandSpec::new("kubectl").args(["get", "pods"]);
        let err = CommandOutput::failure(1, "connection refused\n")
            .check(&spec)
            .unwrap_err();
        match err {
            DeployError::ExternalTool { command, code, stderr } => {
                assert_eq!(command, "kubectl get pods");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&CommandSpec::shell("printf hello; printf oops >&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout_str(), "hello");
        assert_eq!(output.stderr_str(), "oops");
    }

    #[tokio::test]
    async fn test_system_runner_feeds_stdin() {
        let runner = SystemCommandRunner::new();
        let output = run_checked(&runner, &CommandSpec::new("cat").stdin_bytes(b"piped".to_vec()))
            .await
            .unwrap();
        assert_eq!(output.stdout_str(), "piped");
    }

    #[tokio::test]
    async fn test_system_runner_spawn_failure() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-ricdeploy"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ExternalTool { code: None, .. }));
    }
}
