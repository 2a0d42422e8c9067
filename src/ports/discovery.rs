use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::model::{Rule, ServiceDefinition, ServiceInstance};

/// A service definition with its complete current instance set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ServiceEntry {
    pub definition: ServiceDefinition,
    pub instances: Vec<ServiceInstance>,
}

/// Everything the discovery collaborator knows at one point in time.
/// Rules replace the whole rule set; each service entry replaces that
/// service's definition and instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiscoverySnapshot {
    pub rules: Vec<Rule>,
    pub services: Vec<ServiceEntry>,
}

/// Source of rules and service instances that can signal changes.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Load the current snapshot.
    async fn load_snapshot(&self) -> Result<DiscoverySnapshot>;

    /// Return a channel that signals when the snapshot has changed.
    /// The receiver should trigger a reload by calling `load_snapshot`.
    fn watch(&self) -> mpsc::Receiver<()>;
}
