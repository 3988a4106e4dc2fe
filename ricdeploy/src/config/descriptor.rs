//! xApp descriptor (`config-file.json`) parsing.
//!
//! Only the fields the orchestrator reads are modelled; everything else in
//! the descriptor is passed through to the registry untouched.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::DeployError;

/// The parts of an xApp descriptor used for deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XappDescriptor {
    /// Workload name.
    pub xapp_name: String,
    /// Workload version.
    pub version: String,
    /// Containers making up the workload.
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
    /// Messaging ports.
    #[serde(default)]
    pub messaging: Option<Messaging>,
}

/// A container entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEntry {
    /// Container name.
    pub name: String,
    /// Image coordinates.
    pub image: ImageEntry,
}

/// Image coordinates of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Registry host.
    #[serde(default)]
    pub registry: String,
    /// Repository name.
    pub name: String,
    /// Tag.
    pub tag: String,
}

impl ImageEntry {
    /// Full image reference.
    #[must_use]
    pub fn reference(&self) -> String {
        if self.registry.is_empty() {
            format!("{}:{}", self.name, self.tag)
        } else {
            format!("{}/{}:{}", self.registry, self.name, self.tag)
        }
    }
}

/// Messaging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Messaging {
    /// Declared ports.
    #[serde(default)]
    pub ports: Vec<MessagingPort>,
}

/// A declared messaging port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingPort {
    /// Port name.
    pub name: String,
    /// Owning container.
    #[serde(default)]
    pub container: String,
    /// Port number.
    pub port: u16,
}

impl XappDescriptor {
    /// Parses descriptor JSON.
    pub fn from_json(input: &str) -> Result<Self, DeployError> {
        let descriptor: Self = serde_json::from_str(input)?;
        if descriptor.xapp_name.trim().is_empty() {
            return Err(DeployError::config("descriptor has an empty xapp_name"));
        }
        Ok(descriptor)
    }

    /// Reads and parses a descriptor file.
    pub async fn load(path: &Path) -> Result<Self, DeployError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            DeployError::config(format!("cannot read descriptor {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Looks up a messaging port by name.
    #[must_use]
    pub fn port(&self, name: &str) -> Option<u16> {
        self.messaging
            .as_ref()?
            .ports
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "xapp_name": "trafficxapp",
        "version": "1.0.0",
        "containers": [
            {
                "name": "trafficxapp",
                "image": {"registry": "127.0.0.1:5000", "name": "trafficxapp", "tag": "1.0.0"}
            }
        ],
        "messaging": {
            "ports": [
                {"name": "http", "container": "trafficxapp", "port": 8080, "description": "http service"},
                {"name": "rmr-data", "container": "trafficxapp", "port": 4560, "rxMessages": ["RIC_SUB_RESP"]}
            ]
        },
        "rmr": {"protPort": "tcp:4560", "maxSize": 2072}
    }"#;

    #[test]
    fn test_parse_descriptor() {
        let descriptor = XappDescriptor::from_json(DESCRIPTOR).unwrap();
        assert_eq!(descriptor.xapp_name, "trafficxapp");
        assert_eq!(descriptor.version, "1.0.0");
        assert_eq!(
            descriptor.containers[0].image.reference(),
            "127.0.0.1:5000/trafficxapp:1.0.0"
        );
        assert_eq!(descriptor.port("rmr-data"), Some(4560));
        assert_eq!(descriptor.port("missing"), None);
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = XappDescriptor::from_json(r#"{"xapp_name": " ", "version": "1"}"#).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = XappDescriptor::from_json("{not json").unwrap_err();
        assert!(matches!(err, DeployError::Serialization(_)));
    }
}
