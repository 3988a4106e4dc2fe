//! Static payload exchange: the configuration artifact served over HTTP.

use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::errors::DeployError;

/// Address used to pick the outbound interface. No packet is sent.
pub const ROUTE_PROBE: &str = "8.8.8.8:80";

/// Fetches the served artifact.
#[derive(Debug, Clone)]
pub struct PayloadClient {
    client: Client,
}

impl PayloadClient {
    /// Creates a client with a per-request timeout.
    ///
    /// Proxy settings from the environment are ignored: the artifact is
    /// served from this host.
    pub fn new(timeout: Duration) -> Result<Self, DeployError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).no_proxy().build()?,
        })
    }

    /// Shared HTTP client.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Downloads `url`, failing on a non-success status.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, DeployError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeployError::Registry {
                operation: format!("GET {url}"),
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let bytes = response.bytes().await?;
        debug!(url, len = bytes.len(), "Fetched payload");
        Ok(bytes.to_vec())
    }
}

/// Address of the interface that routes towards `probe`.
pub async fn discover_host_address(probe: &str) -> Result<IpAddr, DeployError> {
    let target = lookup_host(probe).await?.next().ok_or_else(|| {
        DeployError::precondition(format!("route probe {probe} resolves to no address"))
    })?;
    let local = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    let address = socket.local_addr()?.ip();
    if address.is_unspecified() {
        return Err(DeployError::precondition(format!(
            "no route towards {probe} to derive the host address"
        )));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_probe_resolves_loopback() {
        let address = discover_host_address("127.0.0.1:9").await.unwrap();
        assert!(address.is_loopback());
    }

    #[tokio::test]
    async fn test_ipv6_probe_resolves_ipv6() {
        // Hosts without an IPv6 loopback cannot route the probe at all.
        if std::net::UdpSocket::bind("[::1]:0").is_err() {
            return;
        }
        let address = discover_host_address("[::1]:9").await.unwrap();
        assert!(address.is_ipv6());
        assert!(address.is_loopback());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_http_error() {
        let client = PayloadClient::new(Duration::from_secs(2)).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client
            .fetch(&format!("http://127.0.0.1:{port}/config-file.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Http(_)));
    }
}
