//! Deploy and undeploy plans.
//!
//! [`DeployPlan`] turns a [`DeployConfig`] into ordered pipelines of stage
//! actions. Collaborators (command runner, chart registry, process table,
//! operator) are injected through [`Collaborators`] so the same plan runs
//! against the real host or against the fakes in [`crate::testing`].
//!
//! The deploy pipeline runs, in order and skipping sections the
//! configuration leaves out:
//!
//! 1. `reclaim-ports`
//! 2. each setup command, under its own failure policy
//! 3. `load-descriptor`, `resolve-host`
//! 4. `ensure-network`, `static-file-server`
//! 5. `stage-payload`, `verify-payload-served`
//! 6. `build-image`, `ensure-services`
//! 7. `onboard-descriptor`, `instantiate-xapp`, `verify-pod`

pub mod actions;
mod session;
mod status;

pub use session::LogSession;
pub use status::{collect_status, PortOwner, StatusReport};

use std::fmt;
use std::sync::Arc;

use crate::config::DeployConfig;
use crate::context::DeploymentContext;
use crate::core::FailurePolicy;
use crate::errors::DeployError;
use crate::events::{EventSink, LoggingEventSink};
use crate::exec::{CommandRunner, CommandSpec, SystemCommandRunner};
use crate::observability::Diagnostics;
use crate::operator::Confirmer;
use crate::pipeline::{CommandAction, PipelineRunner, Stage};
use crate::platform::{ChartRegistry, Cluster, HttpChartRegistry, PayloadClient, ROUTE_PROBE};
use crate::process::{PortReclaimer, ProcessTable, ProcfsProcessTable};
use crate::resources::docker::{ContainerBackend, ContainerSpec, Docker, ImageBackend, NetworkBackend};
use crate::resources::kubectl::ServiceObjectBackend;
use crate::resources::{IdempotentResourceEnsurer, ManagedResource};

use actions::{
    BuildImage, EnsureResources, InstantiateWorkload, LoadDescriptor, OnboardDescriptor,
    ReclaimPorts, ResolveHost, StagePayload, StaticServer, UndeployWorkload, VerifyPayloadServed,
    VerifyPod, VerifyPodsGone,
};

/// Everything a plan talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    /// Runs docker, kubectl and setup commands.
    pub runner: Arc<dyn CommandRunner>,
    /// Chart registry and workload manager.
    pub registry: Arc<dyn ChartRegistry>,
    /// Port owners and signals.
    pub processes: Arc<dyn ProcessTable>,
    /// Operator confirmations.
    pub confirmer: Confirmer,
    /// Downloads the served artifact.
    pub payload: PayloadClient,
    /// Address routed towards to discover the host address.
    pub route_probe: String,
}

impl Collaborators {
    /// Real host collaborators for `config`.
    pub fn system(config: &DeployConfig, confirmer: Confirmer) -> Result<Self, DeployError> {
        Ok(Self {
            runner: Arc::new(SystemCommandRunner::new()),
            registry: Arc::new(HttpChartRegistry::from_config(&config.registry)?),
            processes: Arc::new(ProcfsProcessTable::new()),
            confirmer,
            payload: PayloadClient::new(config.registry.request_timeout())?,
            route_probe: ROUTE_PROBE.to_string(),
        })
    }

    /// Discovers the host address by routing towards `probe`.
    #[must_use]
    pub fn with_route_probe(mut self, probe: impl Into<String>) -> Self {
        self.route_probe = probe.into();
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("confirmer", &self.confirmer)
            .field("route_probe", &self.route_probe)
            .finish_non_exhaustive()
    }
}

/// Builds the deploy and undeploy pipelines for one configuration.
pub struct DeployPlan {
    config: DeployConfig,
    collaborators: Collaborators,
    events: Arc<dyn EventSink>,
    diagnostics: Diagnostics,
}

impl DeployPlan {
    /// Creates a plan for `config`.
    #[must_use]
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            events: Arc::new(LoggingEventSink::default()),
            diagnostics: Diagnostics::stderr(),
        }
    }

    /// Sets the event sink the pipelines emit to.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets where stage diagnostics are printed.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// The configuration this plan was built from.
    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// The injected collaborators.
    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// A fresh context seeded from the configuration.
    #[must_use]
    pub fn context(&self) -> DeploymentContext {
        DeploymentContext::from_config(&self.config)
    }

    /// Cluster client in the workload namespace.
    #[must_use]
    pub fn cluster(&self) -> Cluster {
        Cluster::new(self.collaborators.runner.clone(), self.config.xapp.namespace.clone())
    }

    fn docker(&self) -> Docker {
        Docker::new(self.collaborators.runner.clone())
    }

    /// Port reclaimer tuned by the configuration.
    #[must_use]
    pub fn reclaimer(&self) -> PortReclaimer {
        PortReclaimer::from_config(
            self.collaborators.processes.clone(),
            self.collaborators.confirmer.clone(),
            &self.config.ports,
        )
    }

    fn runner(&self, name: &str) -> PipelineRunner {
        PipelineRunner::new(name, self.collaborators.confirmer.clone())
            .with_events(self.events.clone())
            .with_diagnostics(self.diagnostics.clone())
    }

    /// The deployment pipeline.
    #[must_use]
    pub fn deploy(&self) -> PipelineRunner {
        let config = &self.config;
        let collab = &self.collaborators;
        let ensurer = Arc::new(IdempotentResourceEnsurer::new());
        let docker = self.docker();
        let cluster = self.cluster();
        let mut stages = Vec::new();

        if !config.ports.reserved.is_empty() {
            stages.push(Stage::fatal(
                "reclaim-ports",
                ReclaimPorts::new(self.reclaimer(), config.ports.reserved.clone()),
            ));
        }

        for cmd in &config.setup {
            stages.push(Stage::new(
                cmd.name.clone(),
                Arc::new(CommandAction::new(collab.runner.clone(), CommandSpec::shell(cmd.run.clone()))),
                cmd.policy,
            ));
        }

        stages.push(Stage::fatal(
            "load-descriptor",
            LoadDescriptor::new(config.xapp.descriptor.clone()),
        ));
        stages.push(Stage::fatal("resolve-host", ResolveHost::new(collab.route_probe.clone())));

        if let Some(network) = &config.network {
            let backend = NetworkBackend::new(docker.clone()).with_driver(network.driver.clone());
            stages.push(Stage::fatal(
                "ensure-network",
                EnsureResources::new(
                    ensurer.clone(),
                    vec![ManagedResource::new(network.name.clone(), Arc::new(backend))],
                ),
            ));
        }

        if let Some(server) = &config.payload.server {
            let spec = ContainerSpec {
                image: server.image.clone(),
                network: config.network.as_ref().map(|n| n.name.clone()),
                ports: vec![(server.host_port, server.container_port)],
                volumes: vec![(config.payload.serve_dir.clone(), server.mount_path.clone())],
            };
            let container = ManagedResource::new(
                server.container.clone(),
                Arc::new(ContainerBackend::new(docker.clone(), spec)),
            );
            stages.push(Stage::fatal(
                "static-file-server",
                StaticServer::new(
                    ensurer.clone(),
                    container,
                    docker.clone(),
                    config.network.as_ref().map(|n| n.name.clone()),
                ),
            ));
        }

        stages.push(Stage::fatal("stage-payload", StagePayload::new(config.payload.clone())));
        stages.push(Stage::fatal(
            "verify-payload-served",
            VerifyPayloadServed::new(collab.payload.clone(), &config.payload, config.health),
        ));

        if let Some(image) = &config.image {
            let backend = ImageBackend::new(docker, image.context_dir.clone(), image.dockerfile.clone());
            stages.push(Stage::new(
                "build-image",
                Arc::new(BuildImage::new(
                    ensurer.clone(),
                    ManagedResource::new(image.reference(), Arc::new(backend)),
                )),
                image.policy,
            ));
        }

        if !config.services.is_empty() {
            let resources = config
                .services
                .iter()
                .map(|svc| {
                    let backend = ServiceObjectBackend::new(cluster.clone(), svc.manifest.clone())
                        .with_namespace(svc.namespace.clone());
                    ManagedResource::new(svc.name.clone(), Arc::new(backend))
                })
                .collect();
            stages.push(Stage::fatal("ensure-services", EnsureResources::new(ensurer, resources)));
        }

        stages.push(Stage::fatal(
            "onboard-descriptor",
            OnboardDescriptor::new(collab.registry.clone(), config.health),
        ));
        stages.push(Stage::fatal(
            "instantiate-xapp",
            InstantiateWorkload::new(collab.registry.clone(), cluster.clone()),
        ));
        stages.push(Stage::fatal("verify-pod", VerifyPod::new(cluster, config.health)));

        self.runner("deploy").with_stages(stages)
    }

    /// The removal pipeline.
    #[must_use]
    pub fn undeploy(&self) -> PipelineRunner {
        let config = &self.config;
        let mut stages = vec![
            Stage::fatal("load-descriptor", LoadDescriptor::new(config.xapp.descriptor.clone())),
            Stage::fatal(
                "undeploy-xapp",
                UndeployWorkload::new(self.collaborators.registry.clone()),
            ),
            Stage::prompt_continue(
                "verify-pods-gone",
                VerifyPodsGone::new(self.cluster(), config.health),
            ),
        ];
        if !config.ports.reserved.is_empty() {
            stages.push(Stage::new(
                "reclaim-ports",
                Arc::new(ReclaimPorts::new(self.reclaimer(), config.ports.reserved.clone())),
                FailurePolicy::PromptContinue,
            ));
        }
        self.runner("undeploy").with_stages(stages)
    }

    /// The post-deploy log/port-forward session, when configured.
    #[must_use]
    pub fn session(&self) -> Option<LogSession> {
        self.config
            .session
            .clone()
            .map(|session| LogSession::new(self.cluster(), session))
    }
}

impl fmt::Debug for DeployPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployPlan")
            .field("xapp", &self.config.xapp.name)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageConfig, NetworkConfig, SetupCommand, StaticServerConfig};
    use crate::operator::{Answer, PromptPolicy};
    use crate::testing::{FakeChartRegistry, FakeCommandRunner, FakeProcessTable};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn collaborators() -> Collaborators {
        Collaborators {
            runner: Arc::new(FakeCommandRunner::new()),
            registry: Arc::new(FakeChartRegistry::new()),
            processes: Arc::new(FakeProcessTable::new()),
            confirmer: Confirmer::console(PromptPolicy::unattended(Answer::No)),
            payload: PayloadClient::new(Duration::from_secs(1)).unwrap(),
            route_probe: "127.0.0.1:9".to_string(),
        }
    }

    fn stage_names(runner: &PipelineRunner) -> Vec<String> {
        runner.stages().iter().map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn test_minimal_deploy_plan() {
        let plan = DeployPlan::new(DeployConfig::default(), collaborators());
        assert_eq!(
            stage_names(&plan.deploy()),
            vec![
                "load-descriptor",
                "resolve-host",
                "stage-payload",
                "verify-payload-served",
                "onboard-descriptor",
                "instantiate-xapp",
                "verify-pod",
            ]
        );
    }

    #[test]
    fn test_full_deploy_plan_order_and_policies() {
        let mut config = DeployConfig::default();
        config.ports.reserved = vec![8086];
        config.setup = vec![SetupCommand {
            name: "install-deps".to_string(),
            run: "apt-get install -y jq".to_string(),
            policy: FailurePolicy::PromptContinue,
        }];
        config.network = Some(NetworkConfig {
            name: "my_network".to_string(),
            driver: None,
        });
        config.payload.server = Some(StaticServerConfig::default());
        config.image = Some(ImageConfig {
            name: "trafficxapp".to_string(),
            ..ImageConfig::default()
        });

        let runner = DeployPlan::new(config, collaborators()).deploy();
        assert_eq!(
            stage_names(&runner),
            vec![
                "reclaim-ports",
                "install-deps",
                "load-descriptor",
                "resolve-host",
                "ensure-network",
                "static-file-server",
                "stage-payload",
                "verify-payload-served",
                "build-image",
                "onboard-descriptor",
                "instantiate-xapp",
                "verify-pod",
            ]
        );
        let policies: Vec<FailurePolicy> = runner.stages().iter().map(Stage::policy).collect();
        assert_eq!(policies[0], FailurePolicy::Fatal);
        assert_eq!(policies[1], FailurePolicy::PromptContinue);
        assert_eq!(policies[8], FailurePolicy::PromptContinue);
    }

    #[test]
    fn test_undeploy_plan() {
        let mut config = DeployConfig::default();
        config.ports.reserved = vec![8086];
        let runner = DeployPlan::new(config, collaborators()).undeploy();
        assert_eq!(
            stage_names(&runner),
            vec!["load-descriptor", "undeploy-xapp", "verify-pods-gone", "reclaim-ports"]
        );
        assert_eq!(runner.stages()[3].policy(), FailurePolicy::PromptContinue);
    }

    #[test]
    fn test_session_only_when_configured() {
        let mut config = DeployConfig::default();
        assert!(DeployPlan::new(config.clone(), collaborators()).session().is_none());
        config.session = Some(crate::config::SessionConfig::default());
        assert!(DeployPlan::new(config, collaborators()).session().is_some());
    }
}
