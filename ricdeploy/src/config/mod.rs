//! Deployment configuration.
//!
//! A single TOML document describes the workload, where its configuration
//! artifact is served from, which cluster/container resources it needs and
//! how patient the health gates are. Every field has a default so an empty
//! file is a valid (if not very useful) configuration.

mod descriptor;

pub use descriptor::XappDescriptor;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::checksum::DigestAlgorithm;
use crate::core::FailurePolicy;
use crate::errors::DeployError;
use crate::operator::PromptPolicy;

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("valid regex")
});

static DOCKER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("valid regex"));

/// Top-level deployment configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    /// Workload identity.
    pub xapp: XappConfig,
    /// Chart registry and workload manager endpoints.
    pub registry: RegistryConfig,
    /// Configuration artifact served to the registry.
    pub payload: PayloadConfig,
    /// Container image to build.
    pub image: Option<ImageConfig>,
    /// Container network the static file server joins.
    pub network: Option<NetworkConfig>,
    /// Cluster service objects that must exist.
    pub services: Vec<ServiceObjectConfig>,
    /// Fixed host ports the pipeline depends on.
    pub ports: PortsConfig,
    /// Health gate tuning.
    pub health: HealthConfig,
    /// Operator prompt behavior.
    pub prompt: PromptPolicy,
    /// Opaque setup commands run before provisioning.
    pub setup: Vec<SetupCommand>,
    /// Optional log/port-forward session after deployment.
    pub session: Option<SessionConfig>,
}

/// Workload identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XappConfig {
    /// Workload name. Overridden by the descriptor when empty.
    pub name: String,
    /// Workload version. Overridden by the descriptor when empty.
    pub version: String,
    /// Namespace the workload runs in.
    pub namespace: String,
    /// Pod label selector; defaults to `app=<namespace>-<name>`.
    pub selector: Option<String>,
    /// Path to the xApp descriptor JSON.
    pub descriptor: Option<PathBuf>,
}

impl Default for XappConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            namespace: "ricxapp".to_string(),
            selector: None,
            descriptor: None,
        }
    }
}

/// Chart registry and workload manager endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Base URL of the onboarding service.
    pub onboard_url: String,
    /// Base URL of the workload manager.
    pub appmgr_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            onboard_url: "http://127.0.0.1:8888".to_string(),
            appmgr_url: "http://127.0.0.1:32080/appmgr".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl RegistryConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration artifact served over HTTP for onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayloadConfig {
    /// Local source of the artifact.
    pub source: PathBuf,
    /// Directory the static file server serves.
    pub serve_dir: PathBuf,
    /// Public URL of the artifact; `{host}` is replaced by the discovered host address.
    pub public_url: String,
    /// Digest used to compare source, copy and download.
    pub algorithm: DigestAlgorithm,
    /// Static file server container, when the pipeline should run one.
    pub server: Option<StaticServerConfig>,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("init/config-file.json"),
            serve_dir: PathBuf::from("/var/www/xApp_config.local/config_files"),
            public_url: "http://{host}:8090/config_files/config-file.json".to_string(),
            algorithm: DigestAlgorithm::Sha256,
            server: None,
        }
    }
}

impl PayloadConfig {
    /// File name the artifact is published under.
    #[must_use]
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.source.file_name()
    }

    /// Destination path inside the served directory.
    #[must_use]
    pub fn served_path(&self) -> Option<PathBuf> {
        self.file_name().map(|name| self.serve_dir.join(name))
    }

    /// Resolves the public URL for `host`.
    #[must_use]
    pub fn resolve_url(&self, host: &str) -> String {
        self.public_url.replace("{host}", host)
    }
}

/// Static file server container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StaticServerConfig {
    /// Container name.
    pub container: String,
    /// Image to run.
    pub image: String,
    /// Host port published.
    pub host_port: u16,
    /// Container port the server listens on.
    pub container_port: u16,
    /// Mount point of `serve_dir` inside the container.
    pub mount_path: String,
}

impl Default for StaticServerConfig {
    fn default() -> Self {
        Self {
            container: "xapp-config-server".to_string(),
            image: "nginx:alpine".to_string(),
            host_port: 8090,
            container_port: 80,
            mount_path: "/usr/share/nginx/html/config_files".to_string(),
        }
    }
}

/// Container image built from a local context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Repository name.
    pub name: String,
    /// Tag.
    pub tag: String,
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Dockerfile, relative to the context when not absolute.
    pub dockerfile: Option<PathBuf>,
    /// What to do when the build fails.
    pub policy: FailurePolicy,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            tag: "latest".to_string(),
            context_dir: PathBuf::from("."),
            dockerfile: None,
            policy: FailurePolicy::PromptContinue,
        }
    }
}

impl ImageConfig {
    /// `name:tag` reference.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Container network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Network name.
    pub name: String,
    /// Network driver, daemon default when unset.
    #[serde(default)]
    pub driver: Option<String>,
}

/// Cluster service object applied from a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceObjectConfig {
    /// Service name.
    pub name: String,
    /// Namespace; the workload namespace when unset.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Manifest applied when the service is missing.
    pub manifest: PathBuf,
}

/// Fixed host ports and how they are reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsConfig {
    /// Ports that must be free before the pipeline starts.
    pub reserved: Vec<u16>,
    /// Time a process gets to exit after each termination signal.
    pub grace_period_ms: u64,
    /// Liveness polling interval within the grace period.
    pub poll_interval_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            reserved: Vec::new(),
            grace_period_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

impl PortsConfig {
    /// Grace period as a duration.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Health gate tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Interval between polls.
    pub poll_interval_ms: u64,
    /// Maximum number of polls.
    pub max_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_attempts: 30,
        }
    }
}

impl HealthConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// An opaque shell command run as a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupCommand {
    /// Stage name.
    pub name: String,
    /// Shell command line.
    pub run: String,
    /// What to do when it fails.
    #[serde(default = "prompt_continue")]
    pub policy: FailurePolicy,
}

fn prompt_continue() -> FailurePolicy {
    FailurePolicy::PromptContinue
}

/// Interactive session after deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Port-forward target (`svc/name`, `pod/name`); the running pod when unset.
    pub target: Option<String>,
    /// Local port of the forward; no forward when unset.
    pub local_port: Option<u16>,
    /// Remote port of the forward.
    pub remote_port: u16,
    /// Follow the workload logs in the foreground.
    pub follow_logs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: None,
            local_port: None,
            remote_port: 8080,
            follow_logs: true,
        }
    }
}

impl DeployConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, DeployError> {
        toml::from_str(input).map_err(|e| DeployError::config(e.to_string()))
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, DeployError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DeployError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, DeployError> {
        toml::to_string_pretty(self).map_err(|e| DeployError::config(e.to_string()))
    }

    /// Checks names, ports and tunings.
    pub fn validate(&self) -> Result<(), DeployError> {
        if !self.xapp.name.is_empty() {
            check_dns_label("xapp.name", &self.xapp.name)?;
        }
        check_dns_label("xapp.namespace", &self.xapp.namespace)?;

        if self.payload.public_url.trim().is_empty() {
            return Err(DeployError::config("payload.public_url must not be empty"));
        }
        if self.payload.file_name().is_none() {
            return Err(DeployError::config("payload.source must name a file"));
        }
        if let Some(server) = &self.payload.server {
            check_docker_name("payload.server.container", &server.container)?;
        }

        if let Some(image) = &self.image {
            if image.name.is_empty() {
                return Err(DeployError::config("image.name must not be empty"));
            }
        }
        if let Some(network) = &self.network {
            check_docker_name("network.name", &network.name)?;
        }
        for service in &self.services {
            check_dns_label("services.name", &service.name)?;
            if let Some(ns) = &service.namespace {
                check_dns_label("services.namespace", ns)?;
            }
        }

        let mut seen = HashSet::new();
        for port in &self.ports.reserved {
            if *port == 0 {
                return Err(DeployError::config("ports.reserved must not contain 0"));
            }
            if !seen.insert(*port) {
                return Err(DeployError::config(format!(
                    "ports.reserved lists {port} more than once"
                )));
            }
        }
        if self.ports.poll_interval_ms == 0 {
            return Err(DeployError::config("ports.poll_interval_ms must be positive"));
        }

        if self.health.max_attempts == 0 {
            return Err(DeployError::config("health.max_attempts must be positive"));
        }
        if self.health.poll_interval_ms == 0 {
            return Err(DeployError::config("health.poll_interval_ms must be positive"));
        }
        if self.prompt.max_attempts == 0 {
            return Err(DeployError::config("prompt.max_attempts must be positive"));
        }

        let mut stage_names = HashSet::new();
        for cmd in &self.setup {
            if cmd.name.trim().is_empty() || cmd.run.trim().is_empty() {
                return Err(DeployError::config("setup entries need a name and a command"));
            }
            if !stage_names.insert(cmd.name.as_str()) {
                return Err(DeployError::config(format!(
                    "setup stage '{}' is defined twice",
                    cmd.name
                )));
            }
        }
        Ok(())
    }
}

fn check_dns_label(field: &str, value: &str) -> Result<(), DeployError> {
    if DNS_LABEL.is_match(value) {
        Ok(())
    } else {
        Err(DeployError::config(format!(
            "{field} '{value}' is not a valid DNS-1123 label"
        )))
    }
}

fn check_docker_name(field: &str, value: &str) -> Result<(), DeployError> {
    if DOCKER_NAME.is_match(value) {
        Ok(())
    } else {
        Err(DeployError::config(format!("{field} '{value}' is not a valid name")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::PromptMode;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
        [xapp]
        name = "trafficxapp"
        version = "1.0.0"

        [registry]
        onboard_url = "http://10.0.0.5:8888"

        [payload]
        source = "init/config-file.json"
        algorithm = "md5"

        [payload.server]
        host_port = 8091

        [image]
        name = "trafficxapp"
        tag = "1.0.0"

        [network]
        name = "ricnet"

        [[services]]
        name = "service-ricxapp-trafficxapp-rmr"
        manifest = "deploy/rmr-service.yaml"

        [ports]
        reserved = [8086, 8090]
        grace_period_ms = 500

        [prompt]
        mode = "assume_yes"

        [[setup]]
        name = "install-deps"
        run = "apt-get install -y nginx"

        [[setup]]
        name = "sync-sources"
        run = "./sync.sh"
        policy = "fatal"
    "#;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeployConfig::default();
        assert_eq!(config.xapp.namespace, "ricxapp");
        assert_eq!(config.health.max_attempts, 30);
        assert_eq!(config.prompt.max_attempts, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_sample() {
        let config = DeployConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.xapp.name, "trafficxapp");
        assert_eq!(config.registry.onboard_url, "http://10.0.0.5:8888");
        assert_eq!(config.registry.appmgr_url, "http://127.0.0.1:32080/appmgr");
        assert_eq!(config.payload.algorithm, DigestAlgorithm::Md5);
        assert_eq!(config.payload.server.as_ref().unwrap().host_port, 8091);
        assert_eq!(config.payload.server.as_ref().unwrap().image, "nginx:alpine");
        assert_eq!(config.image.as_ref().unwrap().reference(), "trafficxapp:1.0.0");
        assert_eq!(config.ports.reserved, vec![8086, 8090]);
        assert_eq!(config.ports.grace_period(), Duration::from_millis(500));
        assert_eq!(config.prompt.mode, PromptMode::AssumeYes);
        assert_eq!(config.setup[0].policy, FailurePolicy::PromptContinue);
        assert_eq!(config.setup[1].policy, FailurePolicy::Fatal);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = DeployConfig::from_toml_str("[xapp]\nnmae = \"x\"\n").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut config = DeployConfig::default();
        config.xapp.name = "Traffic_xApp".to_string();
        assert!(config.validate().is_err());

        let mut config = DeployConfig::default();
        config.network = Some(NetworkConfig {
            name: "-bad".to_string(),
            driver: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let mut config = DeployConfig::default();
        config.ports.reserved = vec![8086, 8086];
        assert!(config.validate().is_err());

        config.ports.reserved = vec![0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = DeployConfig::default();
        config.health.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = DeployConfig::default();
        config.prompt.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payload_paths() {
        let payload = PayloadConfig::default();
        assert_eq!(
            payload.served_path().unwrap(),
            PathBuf::from("/var/www/xApp_config.local/config_files/config-file.json")
        );
        assert_eq!(
            payload.resolve_url("10.0.0.7"),
            "http://10.0.0.7:8090/config_files/config-file.json"
        );
    }

    #[test]
    fn test_toml_roundtrip_preserves_sample() {
        let config = DeployConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(DeployConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
