//! Idempotent provisioning of named external resources.
//!
//! Networks, images, containers and cluster service objects are singletons
//! identified by name. Each is checked before it is created, so re-running a
//! partially failed deployment finds what the last run left behind.

pub mod docker;
mod ensurer;
pub mod kubectl;

pub use ensurer::{ensure_all, EnsureOutcome, IdempotentResourceEnsurer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::errors::DeployError;

/// Kinds of managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Container network.
    Network,
    /// Cluster service object.
    ServiceObject,
    /// Built container image.
    ImageArtifact,
    /// Long-running container.
    Container,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::ServiceObject => "service",
            Self::ImageArtifact => "image",
            Self::Container => "container",
        };
        f.write_str(label)
    }
}

/// Existence query and create action for one kind of resource.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Kind handled by this backend.
    fn kind(&self) -> ResourceKind;

    /// Returns true if `identifier` currently exists.
    async fn exists(&self, identifier: &str) -> Result<bool, DeployError>;

    /// Creates `identifier`.
    async fn create(&self, identifier: &str) -> Result<(), DeployError>;
}

/// A named resource and the backend that manages it.
#[derive(Clone)]
pub struct ManagedResource {
    kind: ResourceKind,
    identifier: String,
    backend: Arc<dyn ResourceBackend>,
}

impl ManagedResource {
    /// Creates a managed resource.
    #[must_use]
    pub fn new(identifier: impl Into<String>, backend: Arc<dyn ResourceBackend>) -> Self {
        Self {
            kind: backend.kind(),
            identifier: identifier.into(),
            backend,
        }
    }

    /// Resource kind.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Resource name.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn backend(&self) -> &dyn ResourceBackend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedResource")
            .field("kind", &self.kind)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.identifier)
    }
}
