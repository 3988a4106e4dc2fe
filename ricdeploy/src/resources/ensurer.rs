use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use super::{ManagedResource, ResourceKind};
use crate::errors::DeployError;

/// Result of ensuring a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EnsureOutcome {
    /// The resource was already present; nothing was created.
    AlreadyExists,
    /// The resource was absent, created, and confirmed present.
    Created,
    /// Creation failed or could not be confirmed.
    CreateFailed {
        /// Why.
        reason: String,
    },
}

impl EnsureOutcome {
    /// Returns true unless creation failed.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, Self::CreateFailed { .. })
    }

    /// Maps a failed creation to [`DeployError::ResourceMissing`].
    pub fn into_result(self, resource: &ManagedResource) -> Result<Self, DeployError> {
        match self {
            Self::CreateFailed { reason } => {
                warn!(resource = %resource, %reason, "Resource creation failed");
                Err(DeployError::resource_missing(
                    resource.kind().to_string(),
                    resource.identifier(),
                    format!("create ({reason})"),
                ))
            }
            satisfied => Ok(satisfied),
        }
    }
}

/// Creates resources only when they are missing.
///
/// The create action for a given resource runs at most once per ensurer,
/// so one ensurer should live for exactly one pipeline run.
#[derive(Debug, Default)]
pub struct IdempotentResourceEnsurer {
    attempted: Mutex<HashSet<(ResourceKind, String)>>,
}

impl IdempotentResourceEnsurer {
    /// Creates an ensurer with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a create was already issued for `resource`.
    #[must_use]
    pub fn create_attempted(&self, resource: &ManagedResource) -> bool {
        self.attempted
            .lock()
            .contains(&(resource.kind(), resource.identifier().to_string()))
    }

    /// Makes sure `resource` exists.
    ///
    /// Fails only when the initial existence query fails; a failed create is
    /// reported as [`EnsureOutcome::CreateFailed`].
    pub async fn ensure(&self, resource: &ManagedResource) -> Result<EnsureOutcome, DeployError> {
        let backend = resource.backend();
        let id = resource.identifier();

        if backend.exists(id).await? {
            info!(resource = %resource, "Resource already exists");
            return Ok(EnsureOutcome::AlreadyExists);
        }

        let first_attempt = self
            .attempted
            .lock()
            .insert((resource.kind(), id.to_string()));
        if !first_attempt {
            return Ok(EnsureOutcome::CreateFailed {
                reason: "missing again after it was created earlier in this run".to_string(),
            });
        }

        info!(resource = %resource, "Creating resource");
        if let Err(e) = backend.create(id).await {
            return Ok(EnsureOutcome::CreateFailed {
                reason: e.to_string(),
            });
        }

        match backend.exists(id).await {
            Ok(true) => {
                info!(resource = %resource, "Resource created");
                Ok(EnsureOutcome::Created)
            }
            Ok(false) => Ok(EnsureOutcome::CreateFailed {
                reason: "not found after create".to_string(),
            }),
            Err(e) => Ok(EnsureOutcome::CreateFailed {
                reason: format!("existence check after create failed: {e}"),
            }),
        }
    }
}

/// Ensures every resource in order, stopping at the first failure.
pub async fn ensure_all(
    ensurer: &IdempotentResourceEnsurer,
    resources: &[ManagedResource],
) -> Result<Vec<EnsureOutcome>, DeployError> {
    let mut outcomes = Vec::with_capacity(resources.len());
    for resource in resources {
        let outcome = ensurer.ensure(resource).await?.into_result(resource)?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
