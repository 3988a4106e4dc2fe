//! Stage actions of the deploy and undeploy plans.
//!
//! Each action reads what earlier stages discovered from the
//! [`DeploymentContext`] and records what it discovers there in turn.

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::checksum::ChecksumVerifier;
use crate::config::{HealthConfig, PayloadConfig, XappDescriptor};
use crate::context::DeploymentContext;
use crate::errors::DeployError;
use crate::pipeline::{
    DescriptorListed, HealthGate, HealthProbe, HttpReachable, PodRunning, PodsAbsent, StageAction,
};
use crate::platform::{discover_host_address, is_listed, ChartRegistry, Cluster, PayloadClient};
use crate::process::PortReclaimer;
use crate::resources::docker::Docker;
use crate::resources::{ensure_all, IdempotentResourceEnsurer, ManagedResource};

/// Frees the reserved host ports.
#[derive(Debug)]
pub struct ReclaimPorts {
    reclaimer: PortReclaimer,
    ports: Vec<u16>,
}

impl ReclaimPorts {
    /// Reclaims `ports` in order.
    #[must_use]
    pub fn new(reclaimer: PortReclaimer, ports: Vec<u16>) -> Self {
        Self { reclaimer, ports }
    }
}

#[async_trait]
impl StageAction for ReclaimPorts {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let reservations = self.reclaimer.reclaim_all(&self.ports).await?;
        for reservation in reservations {
            if let Some(pid) = reservation.owner_pid {
                ctx.note(format!("port.{}", reservation.port), format!("reclaimed from pid {pid}"));
            }
        }
        Ok(())
    }
}

/// Loads the descriptor and settles the workload identity.
#[derive(Debug)]
pub struct LoadDescriptor {
    path: Option<PathBuf>,
}

impl LoadDescriptor {
    /// Reads the descriptor at `path`, if any.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl StageAction for LoadDescriptor {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        if let Some(path) = &self.path {
            let descriptor = XappDescriptor::load(path).await?;
            ctx.apply_descriptor(&descriptor);
        }
        let name = ctx.require_xapp_name()?;
        info!(xapp = name, version = ctx.xapp_version(), "Workload identity resolved");
        Ok(())
    }
}

/// Discovers the address other hosts reach this machine on.
#[derive(Debug)]
pub struct ResolveHost {
    probe: String,
}

impl ResolveHost {
    /// Routes towards `probe` to find the outbound address.
    #[must_use]
    pub fn new(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
        }
    }
}

#[async_trait]
impl StageAction for ResolveHost {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let address = discover_host_address(&self.probe).await?;
        info!(address = %address, "Host address discovered");
        ctx.set_host_address(address);
        Ok(())
    }
}

/// Ensures a set of resources exists.
#[derive(Debug)]
pub struct EnsureResources {
    ensurer: Arc<IdempotentResourceEnsurer>,
    resources: Vec<ManagedResource>,
}

impl EnsureResources {
    /// Ensures `resources` in order through `ensurer`.
    #[must_use]
    pub fn new(ensurer: Arc<IdempotentResourceEnsurer>, resources: Vec<ManagedResource>) -> Self {
        Self { ensurer, resources }
    }
}

#[async_trait]
impl StageAction for EnsureResources {
    async fn execute(&self, _ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        ensure_all(&self.ensurer, &self.resources).await?;
        Ok(())
    }
}

/// Runs the static file server and attaches it to the network.
#[derive(Debug)]
pub struct StaticServer {
    ensurer: Arc<IdempotentResourceEnsurer>,
    container: ManagedResource,
    docker: Docker,
    network: Option<String>,
}

impl StaticServer {
    /// Ensures `container` runs, attached to `network` when given.
    #[must_use]
    pub fn new(
        ensurer: Arc<IdempotentResourceEnsurer>,
        container: ManagedResource,
        docker: Docker,
        network: Option<String>,
    ) -> Self {
        Self {
            ensurer,
            container,
            docker,
            network,
        }
    }
}

#[async_trait]
impl StageAction for StaticServer {
    async fn execute(&self, _ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        self.ensurer
            .ensure(&self.container)
            .await?
            .into_result(&self.container)?;
        if let Some(network) = &self.network {
            let connected = self
                .docker
                .ensure_attached(self.container.identifier(), network)
                .await?;
            if connected {
                info!(container = self.container.identifier(), network = %network, "Attached server to network");
            }
        }
        Ok(())
    }
}

fn url_host(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Copies the configuration artifact into the served directory and checks
/// the copy.
#[derive(Debug)]
pub struct StagePayload {
    payload: PayloadConfig,
    verifier: ChecksumVerifier,
}

impl StagePayload {
    /// Stages the artifact described by `payload`.
    #[must_use]
    pub fn new(payload: PayloadConfig) -> Self {
        let verifier = ChecksumVerifier::new(payload.algorithm);
        Self { payload, verifier }
    }
}

#[async_trait]
impl StageAction for StagePayload {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let source = &self.payload.source;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(DeployError::precondition(format!(
                "configuration artifact {} does not exist",
                source.display()
            )));
        }
        let dest = self
            .payload
            .served_path()
            .ok_or_else(|| DeployError::config("payload.source must name a file"))?;
        let host = ctx.host_address().ok_or_else(|| {
            DeployError::precondition("host address must be resolved before staging the artifact")
        })?;

        tokio::fs::create_dir_all(&self.payload.serve_dir).await?;
        tokio::fs::copy(source, &dest).await?;
        debug!(source = %source.display(), dest = %dest.display(), "Artifact copied");

        let pair = self
            .verifier
            .verify_files(source, &dest)
            .await
            .into_result(dest.display().to_string())?;

        let url = self.payload.resolve_url(&url_host(host));
        info!(url = %url, digest = %pair.source_digest, "Artifact staged");
        ctx.set_payload(url, pair.source_digest);
        Ok(())
    }
}

/// Waits until the artifact is served and checks the downloaded bytes.
#[derive(Debug)]
pub struct VerifyPayloadServed {
    client: PayloadClient,
    source: PathBuf,
    verifier: ChecksumVerifier,
    health: HealthConfig,
}

impl VerifyPayloadServed {
    /// Compares the served artifact against `payload.source`.
    #[must_use]
    pub fn new(client: PayloadClient, payload: &PayloadConfig, health: HealthConfig) -> Self {
        Self {
            client,
            source: payload.source.clone(),
            verifier: ChecksumVerifier::new(payload.algorithm),
            health,
        }
    }
}

#[async_trait]
impl StageAction for VerifyPayloadServed {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let url = ctx.require_payload_url()?.to_string();
        let probe = HealthProbe::from_config(
            "payload-served",
            Arc::new(HttpReachable::new(self.client.http().clone(), url.clone())),
            &self.health,
        );
        HealthGate::new().require(&probe).await?;

        let downloaded = self.client.fetch(&url).await?;
        let source = tokio::fs::read(&self.source).await?;
        self.verifier.verify(&source, &downloaded).into_result(url)?;
        Ok(())
    }
}

/// Builds the workload image unless it already exists.
#[derive(Debug)]
pub struct BuildImage {
    ensurer: Arc<IdempotentResourceEnsurer>,
    image: ManagedResource,
}

impl BuildImage {
    /// Ensures `image` through `ensurer`.
    #[must_use]
    pub fn new(ensurer: Arc<IdempotentResourceEnsurer>, image: ManagedResource) -> Self {
        Self { ensurer, image }
    }
}

#[async_trait]
impl StageAction for BuildImage {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        self.ensurer.ensure(&self.image).await?.into_result(&self.image)?;
        ctx.set_image_ref(self.image.identifier());
        Ok(())
    }
}

fn known_version(ctx: &DeploymentContext) -> Option<String> {
    Some(ctx.xapp_version().to_string()).filter(|v| !v.is_empty())
}

/// Registers the descriptor with the chart registry.
pub struct OnboardDescriptor {
    registry: Arc<dyn ChartRegistry>,
    health: HealthConfig,
}

impl OnboardDescriptor {
    /// Onboards through `registry`, waiting per `health` for the listing.
    #[must_use]
    pub fn new(registry: Arc<dyn ChartRegistry>, health: HealthConfig) -> Self {
        Self { registry, health }
    }
}

impl fmt::Debug for OnboardDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnboardDescriptor").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageAction for OnboardDescriptor {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let name = ctx.require_xapp_name()?.to_string();
        let version = known_version(ctx);

        if is_listed(self.registry.as_ref(), &name, version.as_deref()).await? {
            info!(xapp = %name, "Descriptor already onboarded");
            ctx.note("onboard", "already listed");
            return Ok(());
        }

        let url = ctx.require_payload_url()?.to_string();
        self.registry.onboard(&url).await?;

        let probe = HealthProbe::from_config(
            "descriptor-listed",
            Arc::new(DescriptorListed::new(self.registry.clone(), name, version)),
            &self.health,
        );
        HealthGate::new().require(&probe).await?;
        ctx.note("onboard", "onboarded");
        Ok(())
    }
}

/// Starts the workload unless it is already running.
pub struct InstantiateWorkload {
    registry: Arc<dyn ChartRegistry>,
    cluster: Cluster,
}

impl InstantiateWorkload {
    /// Instantiates through `registry`, checking `cluster` first.
    #[must_use]
    pub fn new(registry: Arc<dyn ChartRegistry>, cluster: Cluster) -> Self {
        Self { registry, cluster }
    }
}

impl fmt::Debug for InstantiateWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantiateWorkload")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageAction for InstantiateWorkload {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let name = ctx.require_xapp_name()?.to_string();
        let pods = self.cluster.pods_by_label(&ctx.selector()).await?;
        if pods.iter().any(|pod| pod.is_running()) {
            info!(xapp = %name, pods = pods.len(), "Workload already running");
            ctx.note("instantiate", "already running");
            return Ok(());
        }
        self.registry.instantiate(&name).await
    }
}

/// Waits for a running pod and records its name.
#[derive(Debug)]
pub struct VerifyPod {
    cluster: Cluster,
    health: HealthConfig,
}

impl VerifyPod {
    /// Polls `cluster` per `health`.
    #[must_use]
    pub fn new(cluster: Cluster, health: HealthConfig) -> Self {
        Self { cluster, health }
    }
}

#[async_trait]
impl StageAction for VerifyPod {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let selector = ctx.selector();
        let probe = HealthProbe::from_config(
            "pod-running",
            Arc::new(PodRunning::new(self.cluster.clone(), selector.clone())),
            &self.health,
        );
        HealthGate::new().require(&probe).await?;

        let pods = self.cluster.pods_by_label(&selector).await?;
        let pod = pods.into_iter().find(|pod| pod.is_running()).ok_or_else(|| {
            DeployError::resource_missing("pod", selector.clone(), "readiness check")
        })?;
        info!(pod = %pod.name, restarts = pod.restarts, "Workload pod running");
        ctx.set_pod_name(pod.name);
        Ok(())
    }
}

/// Removes the workload through the registry.
///
/// A workload the registry does not know is treated as already removed.
pub struct UndeployWorkload {
    registry: Arc<dyn ChartRegistry>,
}

impl UndeployWorkload {
    /// Undeploys through `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn ChartRegistry>) -> Self {
        Self { registry }
    }
}

impl fmt::Debug for UndeployWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndeployWorkload").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageAction for UndeployWorkload {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let name = ctx.require_xapp_name()?.to_string();
        match self.registry.undeploy(&name).await {
            Ok(()) => {
                info!(xapp = %name, "Workload removed");
                Ok(())
            }
            Err(DeployError::Registry { status: 404, .. }) => {
                info!(xapp = %name, "Workload not deployed");
                ctx.note("undeploy", "not deployed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Waits until no pod of the workload is left.
#[derive(Debug)]
pub struct VerifyPodsGone {
    cluster: Cluster,
    health: HealthConfig,
}

impl VerifyPodsGone {
    /// Polls `cluster` per `health`.
    #[must_use]
    pub fn new(cluster: Cluster, health: HealthConfig) -> Self {
        Self { cluster, health }
    }
}

#[async_trait]
impl StageAction for VerifyPodsGone {
    async fn execute(&self, ctx: &mut DeploymentContext) -> Result<(), DeployError> {
        let probe = HealthProbe::from_config(
            "pods-absent",
            Arc::new(PodsAbsent::new(self.cluster.clone(), ctx.selector())),
            &self.health,
        );
        HealthGate::new().require(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::DigestAlgorithm;
    use crate::errors::ErrorClass;
    use crate::exec::CommandOutput;
    use crate::testing::{FakeChartRegistry, FakeCommandRunner};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    const RUNNING: &str = r#"{"items":[{"metadata":{"name":"ricxapp-ts-0"},
        "status":{"phase":"Running","containerStatuses":[{"ready":true,"restartCount":0}]}}]}"#;
    const NONE: &str = r#"{"items":[]}"#;

    fn fast_health() -> HealthConfig {
        HealthConfig {
            poll_interval_ms: 1,
            max_attempts: 3,
        }
    }

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("ts", "ricxapp")
    }

    #[test]
    fn test_url_host_brackets_ipv6() {
        assert_eq!(url_host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))), "10.0.0.7");
        assert_eq!(url_host("fe80::1".parse().unwrap()), "[fe80::1]");
    }

    #[tokio::test]
    async fn test_stage_payload_copies_and_records_digest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("config-file.json");
        std::fs::write(&source, br#"{"xapp_name":"ts"}"#).unwrap();
        let payload = PayloadConfig {
            source: source.clone(),
            serve_dir: dir.path().join("served"),
            public_url: "http://{host}:8090/config_files/config-file.json".to_string(),
            algorithm: DigestAlgorithm::Sha256,
            server: None,
        };

        let mut ctx = ctx();
        ctx.set_host_address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        StagePayload::new(payload).execute(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.require_payload_url().unwrap(),
            "http://10.0.0.7:8090/config_files/config-file.json"
        );
        let expected = ChecksumVerifier::new(DigestAlgorithm::Sha256).digest(br#"{"xapp_name":"ts"}"#);
        assert_eq!(ctx.payload_digest(), Some(expected.as_str()));
        assert!(dir.path().join("served/config-file.json").exists());
    }

    #[tokio::test]
    async fn test_stage_payload_missing_source_is_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let payload = PayloadConfig {
            source: dir.path().join("absent.json"),
            serve_dir: dir.path().join("served"),
            ..PayloadConfig::default()
        };
        let mut ctx = ctx();
        ctx.set_host_address(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let err = StagePayload::new(payload).execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[tokio::test]
    async fn test_onboard_skipped_when_listed() {
        let registry = Arc::new(FakeChartRegistry::new().with_chart("ts", "1.0.0"));
        let mut ctx = ctx();

        OnboardDescriptor::new(registry.clone(), fast_health())
            .execute(&mut ctx)
            .await
            .unwrap();

        assert!(registry.onboarded_urls().is_empty());
        assert_eq!(ctx.notes().get("onboard").map(String::as_str), Some("already listed"));
    }

    #[tokio::test]
    async fn test_onboard_submits_url_and_waits_for_listing() {
        let registry = Arc::new(FakeChartRegistry::new().serving("ts", "1.0.0"));
        let mut ctx = ctx();
        ctx.set_payload("http://10.0.0.7:8090/config-file.json", "abc");

        OnboardDescriptor::new(registry.clone(), fast_health())
            .execute(&mut ctx)
            .await
            .unwrap();

        assert_eq!(registry.onboarded_urls(), vec!["http://10.0.0.7:8090/config-file.json"]);
    }

    #[tokio::test]
    async fn test_onboard_times_out_when_never_listed() {
        let registry = Arc::new(FakeChartRegistry::new());
        let mut ctx = ctx();
        ctx.set_payload("http://10.0.0.7:8090/config-file.json", "abc");

        let err = OnboardDescriptor::new(registry, fast_health())
            .execute(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::HealthTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_instantiate_skipped_when_running() {
        let runner = Arc::new(
            FakeCommandRunner::new().respond("kubectl -n ricxapp get pods", CommandOutput::success(RUNNING)),
        );
        let registry = Arc::new(FakeChartRegistry::new());
        let mut ctx = ctx();

        InstantiateWorkload::new(registry.clone(), Cluster::new(runner, "ricxapp"))
            .execute(&mut ctx)
            .await
            .unwrap();
        assert!(registry.instantiated().is_empty());
    }

    #[tokio::test]
    async fn test_verify_pod_records_name() {
        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond_once("kubectl -n ricxapp get pods", CommandOutput::success(NONE))
                .respond("kubectl -n ricxapp get pods", CommandOutput::success(RUNNING)),
        );
        let mut ctx = ctx();

        VerifyPod::new(Cluster::new(runner, "ricxapp"), fast_health())
            .execute(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.pod_name(), Some("ricxapp-ts-0"));
    }

    #[tokio::test]
    async fn test_undeploy_unknown_workload_is_ok() {
        let registry = Arc::new(FakeChartRegistry::new());
        let mut ctx = ctx();

        UndeployWorkload::new(registry.clone()).execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.notes().get("undeploy").map(String::as_str), Some("not deployed"));
        assert!(registry.undeployed().is_empty());
    }
}
