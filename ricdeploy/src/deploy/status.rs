//! Read-only view of a deployment.

use futures::future::try_join;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Collaborators;
use crate::config::{DeployConfig, XappDescriptor};
use crate::context::DeploymentContext;
use crate::errors::DeployError;
use crate::platform::{Cluster, PodStatus};

/// Who holds a reserved port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOwner {
    /// TCP port.
    pub port: u16,
    /// Owning process, `None` when free.
    pub pid: Option<u32>,
    /// Owning process name.
    pub name: Option<String>,
}

/// Snapshot of the workload, the registry and the reserved ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Workload name.
    pub xapp: String,
    /// Namespace.
    pub namespace: String,
    /// Versions the registry lists for the workload; empty when not onboarded.
    pub onboarded_versions: Vec<String>,
    /// Pods matching the workload selector.
    pub pods: Vec<PodStatus>,
    /// Reserved ports and their owners.
    pub ports: Vec<PortOwner>,
}

impl StatusReport {
    /// Returns true if any version is onboarded.
    #[must_use]
    pub fn is_onboarded(&self) -> bool {
        !self.onboarded_versions.is_empty()
    }

    /// Returns true if a pod is running and ready.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pods.iter().any(PodStatus::is_running)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "xApp {} in {}", self.xapp, self.namespace)?;
        if self.is_onboarded() {
            writeln!(f, "  onboarded: {}", self.onboarded_versions.join(", "))?;
        } else {
            writeln!(f, "  onboarded: no")?;
        }
        if self.pods.is_empty() {
            writeln!(f, "  pods: none")?;
        }
        for pod in &self.pods {
            writeln!(
                f,
                "  pod {}: {}{} (restarts {})",
                pod.name,
                pod.phase,
                if pod.ready { ", ready" } else { "" },
                pod.restarts
            )?;
        }
        for port in &self.ports {
            match (port.pid, &port.name) {
                (Some(pid), Some(name)) => writeln!(f, "  port {}: {name} (pid {pid})", port.port)?,
                (Some(pid), None) => writeln!(f, "  port {}: pid {pid}", port.port)?,
                _ => writeln!(f, "  port {}: free", port.port)?,
            }
        }
        Ok(())
    }
}

/// Collects a [`StatusReport`] without changing anything.
pub async fn collect_status(
    config: &DeployConfig,
    collaborators: &Collaborators,
) -> Result<StatusReport, DeployError> {
    let mut ctx = DeploymentContext::from_config(config);
    if let Some(path) = &config.xapp.descriptor {
        ctx.apply_descriptor(&XappDescriptor::load(path).await?);
    }
    let name = ctx.require_xapp_name()?.to_string();

    let cluster = Cluster::new(collaborators.runner.clone(), ctx.namespace());
    let selector = ctx.selector();
    let (entries, pods) = try_join(
        collaborators.registry.list_descriptors(),
        cluster.pods_by_label(&selector),
    )
    .await?;
    let onboarded_versions = entries
        .into_iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.versions)
        .unwrap_or_default();

    let mut ports = Vec::with_capacity(config.ports.reserved.len());
    for &port in &config.ports.reserved {
        let pid = collaborators.processes.owner_of(port)?;
        ports.push(PortOwner {
            port,
            pid,
            name: pid.and_then(|pid| collaborators.processes.process_name(pid)),
        });
    }

    Ok(StatusReport {
        xapp: name,
        namespace: ctx.namespace().to_string(),
        onboarded_versions,
        pods,
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::operator::{Answer, Confirmer, PromptPolicy};
    use crate::platform::PayloadClient;
    use crate::testing::{ExitsOn, FakeChartRegistry, FakeCommandRunner, FakeProcessTable};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const PODS: &str = r#"{"items":[{"metadata":{"name":"ricxapp-ts-0"},
        "status":{"phase":"Running","containerStatuses":[{"ready":true,"restartCount":1}]}}]}"#;

    #[tokio::test]
    async fn test_collect_status_is_read_only() {
        let runner = Arc::new(
            FakeCommandRunner::new().respond("kubectl -n ricxapp get pods", CommandOutput::success(PODS)),
        );
        let registry = Arc::new(FakeChartRegistry::new().with_chart("ts", "1.0.0"));
        let processes = Arc::new(FakeProcessTable::new().with_listener(8086, 4242, "python3", ExitsOn::Graceful));
        let collaborators = Collaborators {
            runner: runner.clone(),
            registry: registry.clone(),
            processes: processes.clone(),
            confirmer: Confirmer::console(PromptPolicy::unattended(Answer::No)),
            payload: PayloadClient::new(Duration::from_secs(1)).unwrap(),
            route_probe: "127.0.0.1:9".to_string(),
        };
        let mut config = DeployConfig::default();
        config.xapp.name = "ts".to_string();
        config.ports.reserved = vec![8086, 8090];

        let report = collect_status(&config, &collaborators).await.unwrap();

        assert!(report.is_onboarded());
        assert!(report.is_running());
        assert_eq!(
            report.ports,
            vec![
                PortOwner {
                    port: 8086,
                    pid: Some(4242),
                    name: Some("python3".to_string()),
                },
                PortOwner {
                    port: 8090,
                    pid: None,
                    name: None,
                },
            ]
        );
        assert!(processes.signals().is_empty());
        assert!(registry.onboarded_urls().is_empty());
        assert_eq!(runner.calls().len(), 1);
        assert!(report.to_string().contains("port 8086: python3 (pid 4242)"));
    }
}
