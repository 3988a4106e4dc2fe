//! Conditions polled by health gates against the real collaborators.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

use super::health::Condition;
use crate::errors::DeployError;
use crate::platform::{is_listed, ChartRegistry, Cluster};
use crate::process::ProcessTable;

/// An HTTP GET returns a success status.
#[derive(Debug, Clone)]
pub struct HttpReachable {
    client: Client,
    url: String,
}

impl HttpReachable {
    /// Checks `url` with `client`.
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Condition for HttpReachable {
    fn describe(&self) -> String {
        format!("GET {} succeeds", self.url)
    }

    async fn check(&self) -> Result<bool, DeployError> {
        let response = self.client.get(&self.url).send().await?;
        Ok(response.status().is_success())
    }
}

/// At least one pod matching a selector is running and ready.
#[derive(Debug, Clone)]
pub struct PodRunning {
    cluster: Cluster,
    selector: String,
}

impl PodRunning {
    /// Watches pods matching `selector`.
    #[must_use]
    pub fn new(cluster: Cluster, selector: impl Into<String>) -> Self {
        Self {
            cluster,
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl Condition for PodRunning {
    fn describe(&self) -> String {
        format!("a pod matching {} is running", self.selector)
    }

    async fn check(&self) -> Result<bool, DeployError> {
        let pods = self.cluster.pods_by_label(&self.selector).await?;
        Ok(pods.iter().any(|p| p.is_running()))
    }
}

/// No pod matches a selector.
#[derive(Debug, Clone)]
pub struct PodsAbsent {
    cluster: Cluster,
    selector: String,
}

impl PodsAbsent {
    /// Watches pods matching `selector`.
    #[must_use]
    pub fn new(cluster: Cluster, selector: impl Into<String>) -> Self {
        Self {
            cluster,
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl Condition for PodsAbsent {
    fn describe(&self) -> String {
        format!("no pod matches {}", self.selector)
    }

    async fn check(&self) -> Result<bool, DeployError> {
        Ok(self.cluster.pods_by_label(&self.selector).await?.is_empty())
    }
}

/// A descriptor shows up in the registry listing.
#[derive(Clone)]
pub struct DescriptorListed {
    registry: Arc<dyn ChartRegistry>,
    name: String,
    version: Option<String>,
}

impl DescriptorListed {
    /// Watches for `name`, optionally at `version`.
    #[must_use]
    pub fn new(registry: Arc<dyn ChartRegistry>, name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            registry,
            name: name.into(),
            version,
        }
    }
}

#[async_trait]
impl Condition for DescriptorListed {
    fn describe(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {version} is onboarded", self.name),
            None => format!("{} is onboarded", self.name),
        }
    }

    async fn check(&self) -> Result<bool, DeployError> {
        is_listed(self.registry.as_ref(), &self.name, self.version.as_deref()).await
    }
}

/// A process is alive.
#[derive(Clone)]
pub struct ProcessAlive {
    table: Arc<dyn ProcessTable>,
    pid: u32,
}

impl ProcessAlive {
    /// Watches `pid`.
    #[must_use]
    pub fn new(table: Arc<dyn ProcessTable>, pid: u32) -> Self {
        Self { table, pid }
    }
}

#[async_trait]
impl Condition for ProcessAlive {
    fn describe(&self) -> String {
        format!("pid {} is alive", self.pid)
    }

    async fn check(&self) -> Result<bool, DeployError> {
        Ok(self.table.is_alive(self.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::pipeline::health::{GateOutcome, HealthGate, HealthProbe};
    use crate::platform::{ChartEntry, MockChartRegistry};
    use crate::testing::{ExitsOn, FakeCommandRunner, FakeProcessTable};
    use std::time::Duration;

    const RUNNING: &str = r#"{"items":[{"metadata":{"name":"ricxapp-ts-1"},"status":{"phase":"Running","containerStatuses":[{"ready":true,"restartCount":0}]}}]}"#;
    const PENDING: &str = r#"{"items":[{"metadata":{"name":"ricxapp-ts-1"},"status":{"phase":"Pending"}}]}"#;

    #[tokio::test]
    async fn test_pod_running_gate_ready_on_third_poll() {
        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond_once("kubectl -n ricxapp get pods", CommandOutput::success(PENDING))
                .respond_once("kubectl -n ricxapp get pods", CommandOutput::failure(1, "connection refused"))
                .respond("kubectl -n ricxapp get pods", CommandOutput::success(RUNNING)),
        );
        let condition = PodRunning::new(Cluster::new(runner.clone(), "ricxapp"), "app=ricxapp-ts");
        let probe = HealthProbe::new("pod", Arc::new(condition), Duration::from_millis(1), 5);

        assert_eq!(HealthGate::new().wait(&probe).await, GateOutcome::Ready { attempts: 3 });
        assert_eq!(runner.calls_matching("kubectl -n ricxapp get pods"), 3);
    }

    #[tokio::test]
    async fn test_pods_absent() {
        let runner = Arc::new(FakeCommandRunner::new().respond(
            "kubectl -n ricxapp get pods",
            CommandOutput::success(r#"{"items":[]}"#),
        ));
        let condition = PodsAbsent::new(Cluster::new(runner, "ricxapp"), "app=ricxapp-ts");
        assert!(condition.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_descriptor_listed() {
        let mut registry = MockChartRegistry::new();
        registry.expect_list_descriptors().returning(|| {
            Ok(vec![ChartEntry {
                name: "ts".to_string(),
                versions: vec!["1.0.0".to_string()],
            }])
        });
        let registry: Arc<dyn ChartRegistry> = Arc::new(registry);

        assert!(DescriptorListed::new(registry.clone(), "ts", None).check().await.unwrap());
        assert!(!DescriptorListed::new(registry, "ts", Some("2.0.0".to_string()))
            .check()
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_process_alive() {
        let table = Arc::new(FakeProcessTable::new().with_listener(8080, 99, "dashboard", ExitsOn::Graceful));
        let condition = ProcessAlive::new(table.clone(), 99);
        assert!(condition.check().await.unwrap());
        assert!(!ProcessAlive::new(table, 100).check().await.unwrap());
    }
}
