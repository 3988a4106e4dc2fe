//! Cluster service objects.

use async_trait::async_trait;
use std::path::PathBuf;

use super::{ResourceBackend, ResourceKind};
use crate::errors::DeployError;
use crate::platform::Cluster;

/// A service object applied from a manifest when missing.
#[derive(Debug, Clone)]
pub struct ServiceObjectBackend {
    cluster: Cluster,
    namespace: Option<String>,
    manifest: PathBuf,
}

impl ServiceObjectBackend {
    /// Creates a backend applying `manifest` in the cluster's namespace.
    #[must_use]
    pub fn new(cluster: Cluster, manifest: impl Into<PathBuf>) -> Self {
        Self {
            cluster,
            namespace: None,
            manifest: manifest.into(),
        }
    }

    /// Targets another namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }
}

#[async_trait]
impl ResourceBackend for ServiceObjectBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ServiceObject
    }

    async fn exists(&self, identifier: &str) -> Result<bool, DeployError> {
        Ok(self
            .cluster
            .get_by_name("service", identifier, self.namespace.as_deref())
            .await?
            .is_some())
    }

    async fn create(&self, _identifier: &str) -> Result<(), DeployError> {
        if !tokio::fs::try_exists(&self.manifest).await.unwrap_or(false) {
            return Err(DeployError::precondition(format!(
                "service manifest {} does not exist",
                self.manifest.display()
            )));
        }
        self.cluster
            .apply(&self.manifest, self.namespace.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::resources::{EnsureOutcome, IdempotentResourceEnsurer, ManagedResource};
    use crate::testing::FakeCommandRunner;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_service_applied_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("rmr-service.yaml");
        std::fs::write(&manifest, "kind: Service\n").unwrap();

        let runner = Arc::new(
            FakeCommandRunner::new()
                .respond_once("kubectl -n ricxapp get service", CommandOutput::success(""))
                .respond(
                    "kubectl -n ricxapp get service",
                    CommandOutput::success(r#"{"kind":"Service"}"#),
                )
                .respond("kubectl -n ricxapp apply", CommandOutput::success("service/rmr created")),
        );
        let cluster = Cluster::new(runner.clone(), "ricxapp");
        let service = ManagedResource::new(
            "service-ricxapp-trafficxapp-rmr",
            Arc::new(ServiceObjectBackend::new(cluster, &manifest)),
        );
        let ensurer = IdempotentResourceEnsurer::new();

        assert_eq!(ensurer.ensure(&service).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(ensurer.ensure(&service).await.unwrap(), EnsureOutcome::AlreadyExists);
        assert_eq!(runner.calls_matching("kubectl -n ricxapp apply -f"), 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_create() {
        let runner = Arc::new(FakeCommandRunner::new());
        let backend = ServiceObjectBackend::new(Cluster::new(runner.clone(), "ricxapp"), "/nonexistent/svc.yaml");

        let err = backend.create("svc").await.unwrap_err();
        assert!(matches!(err, DeployError::Precondition(_)));
        assert_eq!(runner.calls_matching("kubectl"), 0);
    }
}
