//! Explicit deployment state threaded through the pipeline.
//!
//! Values discovered by one stage (host address, artifact URL, pod name) are
//! written here and read by later stages. Nothing is passed through process
//! environment variables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

use crate::config::{DeployConfig, XappDescriptor};
use crate::errors::DeployError;

/// State of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    xapp_name: String,
    xapp_version: String,
    namespace: String,
    explicit_selector: Option<String>,
    host_address: Option<IpAddr>,
    payload_url: Option<String>,
    payload_digest: Option<String>,
    image_ref: Option<String>,
    pod_name: Option<String>,
    notes: BTreeMap<String, String>,
}

impl DeploymentContext {
    /// Creates a context for a workload in `namespace`.
    #[must_use]
    pub fn new(xapp_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            xapp_name: xapp_name.into(),
            xapp_version: String::new(),
            namespace: namespace.into(),
            explicit_selector: None,
            host_address: None,
            payload_url: None,
            payload_digest: None,
            image_ref: None,
            pod_name: None,
            notes: BTreeMap::new(),
        }
    }

    /// Seeds a context from configuration.
    #[must_use]
    pub fn from_config(config: &DeployConfig) -> Self {
        let mut ctx = Self::new(config.xapp.name.clone(), config.xapp.namespace.clone());
        ctx.xapp_version.clone_from(&config.xapp.version);
        ctx.explicit_selector.clone_from(&config.xapp.selector);
        ctx
    }

    /// Fills identity fields the configuration left empty.
    pub fn apply_descriptor(&mut self, descriptor: &XappDescriptor) {
        if self.xapp_name.is_empty() {
            self.xapp_name.clone_from(&descriptor.xapp_name);
        }
        if self.xapp_version.is_empty() {
            self.xapp_version.clone_from(&descriptor.version);
        }
    }

    /// Unique id of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// When this run started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Workload name.
    #[must_use]
    pub fn xapp_name(&self) -> &str {
        &self.xapp_name
    }

    /// Workload name, failing when it is still unknown.
    pub fn require_xapp_name(&self) -> Result<&str, DeployError> {
        if self.xapp_name.is_empty() {
            Err(DeployError::precondition(
                "xApp name is unknown: set xapp.name or xapp.descriptor",
            ))
        } else {
            Ok(&self.xapp_name)
        }
    }

    /// Workload version.
    #[must_use]
    pub fn xapp_version(&self) -> &str {
        &self.xapp_version
    }

    /// Workload namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pod label selector for the workload.
    #[must_use]
    pub fn selector(&self) -> String {
        self.explicit_selector
            .clone()
            .unwrap_or_else(|| format!("app={}-{}", self.namespace, self.xapp_name))
    }

    /// Records the host address the artifact is served from.
    pub fn set_host_address(&mut self, address: IpAddr) {
        self.host_address = Some(address);
    }

    /// Host address, if discovered.
    #[must_use]
    pub fn host_address(&self) -> Option<IpAddr> {
        self.host_address
    }

    /// Records the artifact URL and its digest.
    pub fn set_payload(&mut self, url: impl Into<String>, digest: impl Into<String>) {
        self.payload_url = Some(url.into());
        self.payload_digest = Some(digest.into());
    }

    /// Artifact URL, failing when no stage published it.
    pub fn require_payload_url(&self) -> Result<&str, DeployError> {
        self.payload_url
            .as_deref()
            .ok_or_else(|| DeployError::precondition("configuration artifact URL is not known yet"))
    }

    /// Artifact digest, if recorded.
    #[must_use]
    pub fn payload_digest(&self) -> Option<&str> {
        self.payload_digest.as_deref()
    }

    /// Records the built image reference.
    pub fn set_image_ref(&mut self, reference: impl Into<String>) {
        self.image_ref = Some(reference.into());
    }

    /// Built image reference, if any.
    #[must_use]
    pub fn image_ref(&self) -> Option<&str> {
        self.image_ref.as_deref()
    }

    /// Records the running pod.
    pub fn set_pod_name(&mut self, name: impl Into<String>) {
        self.pod_name = Some(name.into());
    }

    /// Running pod, if verified.
    #[must_use]
    pub fn pod_name(&self) -> Option<&str> {
        self.pod_name.as_deref()
    }

    /// Stores a free-form note for the run report.
    pub fn note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.notes.insert(key.into(), value.into());
    }

    /// Free-form notes.
    #[must_use]
    pub fn notes(&self) -> &BTreeMap<String, String> {
        &self.notes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> XappDescriptor {
        XappDescriptor::from_json(r#"{"xapp_name": "trafficxapp", "version": "2.1.0"}"#).unwrap()
    }

    #[test]
    fn test_descriptor_fills_missing_identity() {
        let mut ctx = DeploymentContext::from_config(&DeployConfig::default());
        assert!(ctx.require_xapp_name().is_err());

        ctx.apply_descriptor(&descriptor());
        assert_eq!(ctx.require_xapp_name().unwrap(), "trafficxapp");
        assert_eq!(ctx.xapp_version(), "2.1.0");
        assert_eq!(ctx.selector(), "app=ricxapp-trafficxapp");
    }

    #[test]
    fn test_config_identity_wins_over_descriptor() {
        let mut config = DeployConfig::default();
        config.xapp.name = "tsxapp".to_string();
        config.xapp.selector = Some("release=ts".to_string());

        let mut ctx = DeploymentContext::from_config(&config);
        ctx.apply_descriptor(&descriptor());

        assert_eq!(ctx.xapp_name(), "tsxapp");
        assert_eq!(ctx.selector(), "release=ts");
    }

    #[test]
    fn test_payload_required_before_use() {
        let mut ctx = DeploymentContext::new("ts", "ricxapp");
        assert!(ctx.require_payload_url().is_err());

        ctx.set_payload("http://10.0.0.1:8090/config-file.json", "abc");
        assert_eq!(
            ctx.require_payload_url().unwrap(),
            "http://10.0.0.1:8090/config-file.json"
        );
        assert_eq!(ctx.payload_digest(), Some("abc"));
    }
}
