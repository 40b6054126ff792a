//! Fleet inventory provider interface

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Tag key marking a server as a member of an autoscaling group
pub const AUTOSCALING_GROUP_TAG: &str = "aws:autoscaling:groupName";

/// Result type for inventory operations
pub type Result<T> = std::result::Result<T, InventoryError>;

/// Errors raised by a fleet inventory provider
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The provider could not be reached; retried before surfacing
    #[error("could not reach inventory provider: {0}")]
    Connectivity(String),

    /// Any other provider failure
    #[error("inventory provider error: {0}")]
    Other(String),
}

impl InventoryError {
    /// True for errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Connectivity(_))
    }
}

/// A live server known to the inventory provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Provider-scoped instance identifier, e.g. `i-0f3a9b2c`
    pub id: String,
    /// Public IP address, if one is attached
    pub public_ip: Option<String>,
    /// Public DNS name
    #[serde(default)]
    pub dns_name: Option<String>,
    /// Private DNS name
    #[serde(default)]
    pub private_dns_name: Option<String>,
    /// Arbitrary key/value tags
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Security/membership groups the server belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl ServerRecord {
    /// True when the server belongs to an autoscaling group and can be
    /// terminated for remediation
    pub fn is_autoscaled(&self) -> bool {
        self.tags.contains_key(AUTOSCALING_GROUP_TAG)
    }
}

/// Resolves infrastructure identifiers to live host records
#[async_trait]
pub trait FleetInventory: Send + Sync {
    /// Look up a server by instance id
    async fn find_by_id(&self, id: &str) -> Result<Option<ServerRecord>>;

    /// All servers carrying the tag `key=value`
    async fn list_by_tag(&self, key: &str, value: &str) -> Result<Vec<ServerRecord>>;

    /// All servers belonging to the named group
    async fn list_by_group(&self, name: &str) -> Result<Vec<ServerRecord>>;

    /// Request termination of an instance; returns whether the provider
    /// accepted the request
    async fn terminate_instance(&self, id: &str) -> Result<bool>;
}

/// An inventory backed by a fixed server list, e.g. from a config file
#[derive(Debug, Default)]
pub struct StaticInventory {
    servers: RwLock<Vec<ServerRecord>>,
}

impl StaticInventory {
    /// Create an inventory from a server list
    pub fn new(servers: Vec<ServerRecord>) -> Self {
        Self {
            servers: RwLock::new(servers),
        }
    }
}

#[async_trait]
impl FleetInventory for StaticInventory {
    async fn find_by_id(&self, id: &str) -> Result<Option<ServerRecord>> {
        Ok(self
            .servers
            .read()
            .unwrap()
            .iter()
            .find(|server| server.id == id)
            .cloned())
    }

    async fn list_by_tag(&self, key: &str, value: &str) -> Result<Vec<ServerRecord>> {
        Ok(self
            .servers
            .read()
            .unwrap()
            .iter()
            .filter(|server| server.tags.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn list_by_group(&self, name: &str) -> Result<Vec<ServerRecord>> {
        Ok(self
            .servers
            .read()
            .unwrap()
            .iter()
            .filter(|server| server.groups.iter().any(|group| group == name))
            .cloned()
            .collect())
    }

    async fn terminate_instance(&self, id: &str) -> Result<bool> {
        let mut servers = self.servers.write().unwrap();
        let before = servers.len();
        servers.retain(|server| server.id != id);
        let removed = servers.len() < before;
        if removed {
            info!(id, "removed terminated instance from static inventory");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, ip: &str, tags: &[(&str, &str)], groups: &[&str]) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            public_ip: Some(ip.to_string()),
            dns_name: Some(format!("{id}.example.net")),
            private_dns_name: None,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[smol_potat::test]
    async fn test_static_inventory_lookups() {
        let inventory = StaticInventory::new(vec![
            server("i-00000001", "10.0.0.1", &[("role", "web")], &["frontend"]),
            server("i-00000002", "10.0.0.2", &[("role", "web")], &["frontend"]),
            server("i-00000003", "10.0.0.3", &[("role", "db")], &["backend"]),
        ]);

        assert!(inventory.find_by_id("i-00000002").await.unwrap().is_some());
        assert!(inventory.find_by_id("i-deadbeef").await.unwrap().is_none());
        assert_eq!(inventory.list_by_tag("role", "web").await.unwrap().len(), 2);
        assert_eq!(inventory.list_by_group("backend").await.unwrap().len(), 1);
    }

    #[smol_potat::test]
    async fn test_terminate_removes_record() {
        let inventory = StaticInventory::new(vec![server("i-00000001", "10.0.0.1", &[], &[])]);
        assert!(inventory.terminate_instance("i-00000001").await.unwrap());
        assert!(!inventory.terminate_instance("i-00000001").await.unwrap());
    }

    #[test]
    fn test_autoscaled_detection() {
        let autoscaled = server("i-1", "1.1.1.1", &[(AUTOSCALING_GROUP_TAG, "web-asg")], &[]);
        let plain = server("i-2", "1.1.1.2", &[("role", "web")], &[]);
        assert!(autoscaled.is_autoscaled());
        assert!(!plain.is_autoscaled());
    }
}
