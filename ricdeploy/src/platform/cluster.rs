//! Cluster workload control through `kubectl`.
//!
//! Only four capability shapes are used: get a resource by name, apply a
//! manifest, read pod status/logs by label and port-forward to a pod.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::errors::DeployError;
use crate::exec::{run_checked, CommandRunner, CommandSpec};

/// Status of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    /// Pod name.
    pub name: String,
    /// Pod phase (`Pending`, `Running`, ...).
    pub phase: String,
    /// Every container reports ready.
    pub ready: bool,
    /// Total container restarts.
    pub restarts: u32,
}

impl PodStatus {
    /// Running with every container ready.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Metadata,
    #[serde(default)]
    status: PodStatusJson,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusJson {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    container_statuses: Vec<ContainerStatusJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatusJson {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    restart_count: u32,
}

/// Parses `kubectl get pods -o json` output.
pub fn parse_pod_list(json: &str) -> Result<Vec<PodStatus>, DeployError> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| {
            let statuses = &pod.status.container_statuses;
            PodStatus {
                name: pod.metadata.name,
                ready: !statuses.is_empty() && statuses.iter().all(|c| c.ready),
                restarts: statuses.iter().map(|c| c.restart_count).sum(),
                phase: pod.status.phase,
            }
        })
        .collect())
}

/// A namespace-scoped view of the cluster.
#[derive(Clone)]
pub struct Cluster {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
}

impl Cluster {
    /// Creates a cluster client defaulting to `namespace`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, namespace: impl Into<String>) -> Self {
        Self {
            runner,
            namespace: namespace.into(),
        }
    }

    /// Default namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn kubectl(&self, namespace: Option<&str>) -> CommandSpec {
        CommandSpec::new("kubectl").args(["-n", namespace.unwrap_or(&self.namespace)])
    }

    /// Fetches `kind/name`, `None` when it does not exist.
    pub async fn get_by_name(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<serde_json::Value>, DeployError> {
        let spec = self
            .kubectl(namespace)
            .args(["get", kind, name, "-o", "json", "--ignore-not-found"]);
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        let stdout = output.stdout_str();
        if stdout.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_str(&stdout)?))
        }
    }

    /// Applies a manifest file.
    pub async fn apply(&self, manifest: &Path, namespace: Option<&str>) -> Result<(), DeployError> {
        let spec = self
            .kubectl(namespace)
            .args(["apply", "-f"])
            .arg(manifest.display().to_string());
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    /// Pods matching `selector`.
    pub async fn pods_by_label(&self, selector: &str) -> Result<Vec<PodStatus>, DeployError> {
        let spec = self
            .kubectl(None)
            .args(["get", "pods", "-l", selector, "-o", "json"]);
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        parse_pod_list(&output.stdout_str())
    }

    /// Command streaming logs of pods matching `selector`.
    #[must_use]
    pub fn logs_command(&self, selector: &str, follow: bool) -> CommandSpec {
        let spec = self
            .kubectl(None)
            .args(["logs", "-l", selector, "--all-containers", "--tail", "100"]);
        if follow {
            spec.arg("-f")
        } else {
            spec
        }
    }

    /// Command forwarding `local_port` to `remote_port` of `target`.
    #[must_use]
    pub fn port_forward_command(&self, target: &str, local_port: u16, remote_port: u16) -> CommandSpec {
        self.kubectl(None)
            .args(["port-forward", target])
            .arg(format!("{local_port}:{remote_port}"))
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
