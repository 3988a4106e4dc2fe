//! Container runtime backends.
//!
//! Queries use `--format '{{json .}}'` and are parsed into typed rows, so
//! existence is decided by exact name comparison rather than substring
//! matching on table output.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{ResourceBackend, ResourceKind};
use crate::errors::DeployError;
use crate::exec::{run_checked, CommandRunner, CommandSpec};

const JSON_FORMAT: &str = "{{json .}}";

/// Thin typed wrapper over the `docker` CLI.
#[derive(Clone)]
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
}

#[derive(Debug, Deserialize)]
struct NetworkRow {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageRow {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct ContainerRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// Presence of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No container with that name.
    Absent,
    /// Present but not running.
    Stopped,
    /// Running.
    Running,
}

/// Splits `repository:tag`. A colon before the last `/` is a registry port.
fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

fn parse_json_lines<T: DeserializeOwned>(stdout: &str) -> Result<Vec<T>, DeployError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(DeployError::from))
        .collect()
}

impl Docker {
    /// Creates a client running commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn command() -> CommandSpec {
        CommandSpec::new("docker")
    }

    async fn query<T: DeserializeOwned>(&self, spec: CommandSpec) -> Result<Vec<T>, DeployError> {
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        parse_json_lines(&output.stdout_str())
    }

    /// Returns true if a network named exactly `name` exists.
    pub async fn network_exists(&self, name: &str) -> Result<bool, DeployError> {
        let rows: Vec<NetworkRow> = self
            .query(Self::command().args(["network", "ls", "--format", JSON_FORMAT]))
            .await?;
        Ok(rows.iter().any(|row| row.name == name))
    }

    /// Creates a network.
    pub async fn create_network(&self, name: &str, driver: Option<&str>) -> Result<(), DeployError> {
        let mut spec = Self::command().args(["network", "create"]);
        if let Some(driver) = driver {
            spec = spec.args(["--driver", driver]);
        }
        run_checked(self.runner.as_ref(), &spec.arg(name)).await?;
        Ok(())
    }

    /// Returns true if `reference` (`name:tag`) is present locally.
    pub async fn image_exists(&self, reference: &str) -> Result<bool, DeployError> {
        let rows: Vec<ImageRow> = self
            .query(Self::command().args(["image", "ls", "--format", JSON_FORMAT, reference]))
            .await?;
        let (name, tag) = split_reference(reference);
        Ok(rows.iter().any(|row| row.repository == name && row.tag == tag))
    }

    /// Builds and tags an image.
    pub async fn build_image(
        &self,
        reference: &str,
        context_dir: &std::path::Path,
        dockerfile: Option<&std::path::Path>,
    ) -> Result<(), DeployError> {
        let mut spec = Self::command().args(["build", "-t", reference]);
        if let Some(dockerfile) = dockerfile {
            spec = spec.arg("-f").arg(dockerfile.display().to_string());
        }
        run_checked(self.runner.as_ref(), &spec.arg(context_dir.display().to_string())).await?;
        Ok(())
    }

    /// Reports whether a container named exactly `name` exists and runs.
    pub async fn container_state(&self, name: &str) -> Result<ContainerState, DeployError> {
        let rows: Vec<ContainerRow> = self
            .query(Self::command().args([
                "ps",
                "-a",
                "--filter",
                &format!("name=^/?{name}$"),
                "--format",
                JSON_FORMAT,
            ]))
            .await?;
        let state = rows
            .iter()
            .find(|row| row.names.split(',').any(|n| n == name))
            .map_or(ContainerState::Absent, |row| {
                if row.state == "running" {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                }
            });
        Ok(state)
    }

    /// Starts an existing stopped container.
    pub async fn start_container(&self, name: &str) -> Result<(), DeployError> {
        run_checked(self.runner.as_ref(), &Self::command().args(["start", name])).await?;
        Ok(())
    }

    /// Runs a detached container.
    pub async fn run_container(&self, name: &str, spec: &ContainerSpec) -> Result<(), DeployError> {
        let mut cmd = Self::command().args(["run", "-d", "--name", name]);
        if let Some(network) = &spec.network {
            cmd = cmd.args(["--network", network.as_str()]);
        }
        for (host, container) in &spec.ports {
            cmd = cmd.arg("-p").arg(format!("{host}:{container}"));
        }
        for (source, target) in &spec.volumes {
            cmd = cmd.arg("-v").arg(format!("{}:{target}", source.display()));
        }
        run_checked(self.runner.as_ref(), &cmd.arg(&spec.image)).await?;
        Ok(())
    }

    /// Networks `container` is attached to.
    pub async fn container_networks(&self, container: &str) -> Result<Vec<String>, DeployError> {
        let spec = Self::command().args([
            "inspect",
            "--format",
            "{{json .NetworkSettings.Networks}}",
            container,
        ]);
        let output = run_checked(self.runner.as_ref(), &spec).await?;
        let networks: HashMap<String, serde_json::Value> =
            serde_json::from_str(output.stdout_str().trim())?;
        let mut names: Vec<String> = networks.into_keys().collect();
        names.sort();
        Ok(names)
    }

    /// Attaches `container` to `network` unless it already is.
    ///
    /// Returns true if a connect was issued.
    pub async fn ensure_attached(&self, container: &str, network: &str) -> Result<bool, DeployError> {
        if self.container_networks(container).await?.iter().any(|n| n == network) {
            info!(container, network, "Container already attached");
            return Ok(false);
        }
        run_checked(
            self.runner.as_ref(),
            &Self::command().args(["network", "connect", network, container]),
        )
        .await?;
        info!(container, network, "Attached container to network");
        Ok(true)
    }
}

impl std::fmt::Debug for Docker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Docker").finish_non_exhaustive()
    }
}

/// How a managed container is run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Network to attach at start.
    pub network: Option<String>,
    /// Host to container port mappings.
    pub ports: Vec<(u16, u16)>,
    /// Host path to container path bind mounts.
    pub volumes: Vec<(PathBuf, String)>,
}

/// Container networks.
#[derive(Debug, Clone)]
pub struct NetworkBackend {
    docker: Docker,
    driver: Option<String>,
}

impl NetworkBackend {
    /// Creates a backend using the daemon's default driver.
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            driver: None,
        }
    }

    /// Uses `driver` for created networks.
    #[must_use]
    pub fn with_driver(mut self, driver: Option<String>) -> Self {
        self.driver = driver;
        self
    }
}

#[async_trait]
impl ResourceBackend for NetworkBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    async fn exists(&self, identifier: &str) -> Result<bool, DeployError> {
        self.docker.network_exists(identifier).await
    }

    async fn create(&self, identifier: &str) -> Result<(), DeployError> {
        self.docker
            .create_network(identifier, self.driver.as_deref())
            .await
    }
}

/// Images built from a local context.
#[derive(Debug, Clone)]
pub struct ImageBackend {
    docker: Docker,
    context_dir: PathBuf,
    dockerfile: Option<PathBuf>,
}

impl ImageBackend {
    /// Creates a backend building from `context_dir`.
    #[must_use]
    pub fn new(docker: Docker, context_dir: impl Into<PathBuf>, dockerfile: Option<PathBuf>) -> Self {
        Self {
            docker,
            context_dir: context_dir.into(),
            dockerfile,
        }
    }
}

#[async_trait]
impl ResourceBackend for ImageBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ImageArtifact
    }

    async fn exists(&self, identifier: &str) -> Result<bool, DeployError> {
        self.docker.image_exists(identifier).await
    }

    async fn create(&self, identifier: &str) -> Result<(), DeployError> {
        self.docker
            .build_image(identifier, &self.context_dir, self.dockerfile.as_deref())
            .await
    }
}

/// Long-running containers. Only a running container counts as present; a
/// stopped one is started instead of recreated.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    docker: Docker,
    spec: ContainerSpec,
}

impl ContainerBackend {
    /// Creates a backend running containers from `spec`.
    #[must_use]
    pub fn new(docker: Docker, spec: ContainerSpec) -> Self {
        Self { docker, spec }
    }
}

#[async_trait]
impl ResourceBackend for ContainerBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    async fn exists(&self, identifier: &str) -> Result<bool, DeployError> {
        Ok(self.docker.container_state(identifier).await? == ContainerState::Running)
    }

    async fn create(&self, identifier: &str) -> Result<(), DeployError> {
        match self.docker.container_state(identifier).await? {
            ContainerState::Stopped => self.docker.start_container(identifier).await,
            ContainerState::Absent => self.docker.run_container(identifier, &self.spec).await,
            ContainerState::Running => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use crate::resources::{EnsureOutcome, IdempotentResourceEnsurer, ManagedResource};
    use crate::testing::FakeCommandRunner;
    use pretty_assertions::assert_eq;

    const NETWORKS: &str = r#"{"Driver":"bridge","ID":"1a2b","Name":"bridge","Scope":"local"}
{"Driver":"bridge","ID":"3c4d","Name":"my_network_2","Scope":"local"}
"#;

    #[tokio::test]
    async fn test_network_exact_name_match() {
        let runner = Arc::new(
            FakeCommandRunner::new().respond("docker network ls", CommandOutput::success(NETWORKS)),
        );
        let docker = Docker::new(runner);

        assert!(docker.network_exists("my_network_2").await.unwrap());
        assert!(!docker.network_exists("my_network").await.unwrap());
    }

    #[tokio::test]
    async fn test_network_ensured_once() {
        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond_once("docker network ls", CommandOutput::success(NETWORKS))
                .respond(
                    "docker network ls",
                    CommandOutput::success(format!("{NETWORKS}{{\"Name\":\"my_network\"}}\n")),
                )
                .respond("docker network create", CommandOutput::success("")),
        );
        let backend = Arc::new(NetworkBackend::new(Docker::new(runner.clone())));
        let network = ManagedResource::new("my_network", backend);
        let ensurer = IdempotentResourceEnsurer::new();

        assert_eq!(ensurer.ensure(&network).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(ensurer.ensure(&network).await.unwrap(), EnsureOutcome::AlreadyExists);
        assert_eq!(runner.calls_matching("docker network create my_network"), 1);
    }

    #[tokio::test]
    async fn test_image_exists_compares_tag() {
        let runner = Arc::new(FakeCommandRunner::new().respond(
            "docker image ls",
            CommandOutput::success(r#"{"Repository":"trafficxapp","Tag":"1.0.0","ID":"abc"}"#),
        ));
        let docker = Docker::new(runner);

        assert!(docker.image_exists("trafficxapp:1.0.0").await.unwrap());
        assert!(!docker.image_exists("trafficxapp:2.0.0").await.unwrap());
    }

    #[test]
    fn test_split_reference_keeps_registry_port() {
        assert_eq!(split_reference("trafficxapp:1.0.0"), ("trafficxapp", "1.0.0"));
        assert_eq!(split_reference("trafficxapp"), ("trafficxapp", "latest"));
        assert_eq!(
            split_reference("registry:5000/ric/trafficxapp"),
            ("registry:5000/ric/trafficxapp", "latest")
        );
        assert_eq!(
            split_reference("registry:5000/ric/trafficxapp:1.2.0"),
            ("registry:5000/ric/trafficxapp", "1.2.0")
        );
    }

    #[tokio::test]
    async fn test_image_exists_with_registry_port() {
        let runner = Arc::new(FakeCommandRunner::new().respond(
            "docker image ls",
            CommandOutput::success(
                r#"{"Repository":"registry:5000/trafficxapp","Tag":"latest","ID":"abc"}"#,
            ),
        ));
        let docker = Docker::new(runner);

        assert!(docker.image_exists("registry:5000/trafficxapp").await.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_container_is_started() {
        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond(
                    "docker ps",
                    CommandOutput::success(r#"{"Names":"xapp-config-server","State":"exited"}"#),
                )
                .respond("docker start", CommandOutput::success("")),
        );
        let backend = ContainerBackend::new(Docker::new(runner.clone()), ContainerSpec::default());

        assert!(!backend.exists("xapp-config-server").await.unwrap());
        backend.create("xapp-config-server").await.unwrap();
        assert_eq!(runner.calls_matching("docker start xapp-config-server"), 1);
        assert_eq!(runner.calls_matching("docker run"), 0);
    }

    #[tokio::test]
    async fn test_run_container_arguments() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| {
                spec.to_string()
                    == "docker run -d --name web --network ricnet -p 8090:80 -v /srv/cfg:/usr/share/nginx/html nginx:alpine"
            })
            .times(1)
            .returning(|_| Ok(CommandOutput::success("")));

        let spec = ContainerSpec {
            image: "nginx:alpine".to_string(),
            network: Some("ricnet".to_string()),
            ports: vec![(8090, 80)],
            volumes: vec![(PathBuf::from("/srv/cfg"), "/usr/share/nginx/html".to_string())],
        };
        Docker::new(Arc::new(runner)).run_container("web", &spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_attached_skips_connected() {
        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond(
                    "docker inspect",
                    CommandOutput::success(r#"{"bridge":{"IPAddress":"172.17.0.2"},"ricnet":{}}"#),
                )
                .respond("docker network connect", CommandOutput::success("")),
        );
        let docker = Docker::new(runner.clone());

        assert!(!docker.ensure_attached("web", "ricnet").await.unwrap());
        assert!(docker.ensure_attached("web", "kong").await.unwrap());
        assert_eq!(runner.calls_matching("docker network connect kong web"), 1);
    }

    #[tokio::test]
    async fn test_query_failure_is_external_tool_error() {
        let runner = Arc::new(FakeCommandRunner::new().respond(
            "docker network ls",
            CommandOutput::failure(1, "Cannot connect to the Docker daemon"),
        ));
        let err = Docker::new(runner).network_exists("x").await.unwrap_err();
        assert!(matches!(err, DeployError::ExternalTool { code: Some(1), .. }));
    }
}
