//! Port-forward and log-follow helpers kept alive until interrupted.

use std::future::Future;
use tracing::info;

use crate::config::SessionConfig;
use crate::context::DeploymentContext;
use crate::errors::DeployError;
use crate::exec::CommandSpec;
use crate::platform::Cluster;
use crate::process::{run_scoped, run_scoped_until, BackgroundSession, ScopeEnd};

/// A post-deploy session against the workload.
#[derive(Debug, Clone)]
pub struct LogSession {
    cluster: Cluster,
    config: SessionConfig,
}

impl LogSession {
    /// Creates a session in `cluster`'s namespace.
    #[must_use]
    pub fn new(cluster: Cluster, config: SessionConfig) -> Self {
        Self { cluster, config }
    }

    /// The port-forward command, when a local port is configured.
    pub fn forward_command(&self, ctx: &DeploymentContext) -> Result<Option<CommandSpec>, DeployError> {
        let Some(local_port) = self.config.local_port else {
            return Ok(None);
        };
        let target = match (&self.config.target, ctx.pod_name()) {
            (Some(target), _) => target.clone(),
            (None, Some(pod)) => format!("pod/{pod}"),
            (None, None) => {
                return Err(DeployError::precondition(
                    "port-forward needs session.target or a verified pod",
                ))
            }
        };
        Ok(Some(self.cluster.port_forward_command(
            &target,
            local_port,
            self.config.remote_port,
        )))
    }

    /// The log-follow command, when enabled.
    #[must_use]
    pub fn logs_command(&self, ctx: &DeploymentContext) -> Option<CommandSpec> {
        self.config
            .follow_logs
            .then(|| self.cluster.logs_command(&ctx.selector(), true))
    }

    fn start(&self, session: &BackgroundSession, ctx: &DeploymentContext) -> Result<(), DeployError> {
        if let Some(forward) = self.forward_command(ctx)? {
            session.start("port-forward", &forward)?;
        }
        if let Some(logs) = self.logs_command(ctx) {
            session.start("logs", &logs)?;
        }
        Ok(())
    }

    /// Runs the helpers until Ctrl-C, then stops them.
    pub async fn run(&self, ctx: &DeploymentContext) -> Result<ScopeEnd<()>, DeployError> {
        let session = BackgroundSession::new();
        self.start(&session, ctx)?;
        if session.active_count() == 0 {
            return Ok(ScopeEnd::Completed(()));
        }
        info!(helpers = session.active_count(), "Session running, Ctrl-C to stop");
        Ok(run_scoped(&session, std::future::pending::<()>()).await)
    }

    /// Like [`LogSession::run`], ending when `interrupt` resolves.
    pub async fn run_until<I>(&self, ctx: &DeploymentContext, interrupt: I) -> Result<ScopeEnd<()>, DeployError>
    where
        I: Future<Output = ()>,
    {
        let session = BackgroundSession::new();
        self.start(&session, ctx)?;
        if session.active_count() == 0 {
            return Ok(ScopeEnd::Completed(()));
        }
        Ok(run_scoped_until(&session, std::future::pending::<()>(), interrupt).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCommandRunner;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn session(config: SessionConfig) -> LogSession {
        LogSession::new(Cluster::new(Arc::new(FakeCommandRunner::new()), "ricxapp"), config)
    }

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("ts", "ricxapp")
    }

    #[test]
    fn test_forward_targets_verified_pod() {
        let s = session(SessionConfig {
            local_port: Some(8080),
            ..SessionConfig::default()
        });
        let mut ctx = ctx();
        assert!(s.forward_command(&ctx).is_err());

        ctx.set_pod_name("ricxapp-ts-0");
        assert_eq!(
            s.forward_command(&ctx).unwrap().unwrap().to_string(),
            "kubectl -n ricxapp port-forward pod/ricxapp-ts-0 8080:8080"
        );
    }

    #[test]
    fn test_no_forward_without_local_port() {
        let s = session(SessionConfig::default());
        assert!(s.forward_command(&ctx()).unwrap().is_none());
        assert!(s.logs_command(&ctx()).unwrap().has_arg("-f"));
    }

    #[tokio::test]
    async fn test_empty_session_completes_immediately() {
        let s = session(SessionConfig {
            follow_logs: false,
            ..SessionConfig::default()
        });
        let end = s.run_until(&ctx(), std::future::pending()).await.unwrap();
        assert_eq!(end, ScopeEnd::Completed(()));
    }
}
