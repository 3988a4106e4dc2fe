//! Chart registry and workload manager REST surface.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::errors::DeployError;

const MAX_ERROR_BODY: usize = 512;

/// A descriptor known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    /// Workload name.
    pub name: String,
    /// Onboarded versions.
    pub versions: Vec<String>,
}

/// Parses the chart listing, a JSON object keyed by workload name whose
/// values are arrays of version records.
pub fn parse_chart_listing(body: &str) -> Result<Vec<ChartEntry>, DeployError> {
    let listing: Value = serde_json::from_str(body)?;
    let Value::Object(map) = listing else {
        return Ok(Vec::new());
    };
    let mut entries: Vec<ChartEntry> = map
        .into_iter()
        .map(|(name, records)| {
            let versions = records
                .as_array()
                .map(|records| {
                    records
                        .iter()
                        .filter_map(|r| r.get("version").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            ChartEntry { name, versions }
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// The three registry operations plus removal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChartRegistry: Send + Sync {
    /// Lists onboarded descriptors.
    async fn list_descriptors(&self) -> Result<Vec<ChartEntry>, DeployError>;

    /// Submits the descriptor served at `artifact_url` for onboarding.
    async fn onboard(&self, artifact_url: &str) -> Result<(), DeployError>;

    /// Instantiates the onboarded workload `name`.
    async fn instantiate(&self, name: &str) -> Result<(), DeployError>;

    /// Removes the running workload `name`.
    async fn undeploy(&self, name: &str) -> Result<(), DeployError>;
}

/// Returns true if `name` (at `version`, when given) is onboarded.
pub async fn is_listed(
    registry: &dyn ChartRegistry,
    name: &str,
    version: Option<&str>,
) -> Result<bool, DeployError> {
    let entries = registry.list_descriptors().await?;
    Ok(entries.iter().any(|entry| {
        entry.name == name && version.map_or(true, |v| entry.versions.iter().any(|ev| ev == v))
    }))
}

/// [`ChartRegistry`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChartRegistry {
    client: Client,
    onboard_url: String,
    appmgr_url: String,
}

impl HttpChartRegistry {
    /// Creates a registry client from configuration.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, DeployError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::with_client(client, &config.onboard_url, &config.appmgr_url))
    }

    /// Creates a registry client with an existing HTTP client.
    #[must_use]
    pub fn with_client(client: Client, onboard_url: &str, appmgr_url: &str) -> Self {
        Self {
            client,
            onboard_url: onboard_url.trim_end_matches('/').to_string(),
            appmgr_url: appmgr_url.trim_end_matches('/').to_string(),
        }
    }

    async fn check(response: Response, operation: String) -> Result<Response, DeployError> {
        let status = response.status();
        if status.is_success() {
            debug!(%operation, status = status.as_u16(), "Registry request succeeded");
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(DeployError::Registry {
            operation,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChartRegistry for HttpChartRegistry {
    async fn list_descriptors(&self) -> Result<Vec<ChartEntry>, DeployError> {
        let url = format!("{}/api/charts", self.onboard_url);
        let response = self.client.get(&url).send().await?;
        let body = Self::check(response, format!("GET {url}")).await?.text().await?;
        parse_chart_listing(&body)
    }

    async fn onboard(&self, artifact_url: &str) -> Result<(), DeployError> {
        let url = format!("{}/api/v1/onboard/download", self.onboard_url);
        let body = json!({ "config-file.json_url": artifact_url });
        info!(%url, artifact_url, "Onboarding descriptor");
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response, format!("POST {url}")).await?;
        Ok(())
    }

    async fn instantiate(&self, name: &str) -> Result<(), DeployError> {
        let url = format!("{}/ric/v1/xapps", self.appmgr_url);
        info!(%url, xapp = name, "Instantiating workload");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "xappName": name }))
            .send()
            .await?;
        Self::check(response, format!("POST {url}")).await?;
        Ok(())
    }

    async fn undeploy(&self, name: &str) -> Result<(), DeployError> {
        let url = format!("{}/ric/v1/xapps/{name}", self.appmgr_url);
        info!(%url, xapp = name, "Removing workload");
        let response = self.client.delete(&url).send().await?;
        Self::check(response, format!("DELETE {url}")).await?;
        Ok(())
    }
}
