use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use super::{ClusterInstance, ClusterKey};

/// Capacity of the registry event channel. A full channel drops events
/// instead of blocking the publisher; the dispatch path must never stall
/// behind a slow consumer.
const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cluster not found")]
    ClusterNotFound,
}

/// Resolves cluster keys to serving instances and fans status events out
/// to whoever owns the backend pools.
pub trait ClusterRegistry: Send + Sync {
    /// Register a cluster identity. Instances arrive via `status_change`.
    fn add_cluster(&self, key: ClusterKey);

    /// Upsert an instance and publish the change.
    fn status_change(&self, instance: ClusterInstance) -> Result<(), RegistryError>;

    fn cluster_instances(&self, key: &ClusterKey) -> Vec<ClusterInstance>;

    fn all_cluster_instances(&self) -> Vec<ClusterInstance>;
}

/// In-memory registry, fed by the admin surface (or a control-plane
/// integration living outside this crate).
pub struct InMemoryClusterRegistry {
    clusters: RwLock<HashMap<ClusterKey, Vec<ClusterInstance>>>,
    events: mpsc::Sender<ClusterInstance>,
}

impl InMemoryClusterRegistry {
    /// Returns the registry plus the event stream consumed by the
    /// backend manager.
    pub fn new() -> (Arc<InMemoryClusterRegistry>, mpsc::Receiver<ClusterInstance>) {
        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        (
            Arc::new(InMemoryClusterRegistry {
                clusters: RwLock::new(HashMap::new()),
                events: tx,
            }),
            rx,
        )
    }
}

impl ClusterRegistry for InMemoryClusterRegistry {
    fn add_cluster(&self, key: ClusterKey) {
        self.clusters.write().entry(key).or_default();
    }

    fn status_change(&self, instance: ClusterInstance) -> Result<(), RegistryError> {
        {
            let mut clusters = self.clusters.write();
            let instances = clusters
                .get_mut(&instance.key)
                .ok_or(RegistryError::ClusterNotFound)?;
            match instances.iter_mut().find(|item| item.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => instances.push(instance.clone()),
            }
        }
        if self.events.try_send(instance).is_err() {
            warn!("registry notify channel full, dropping event");
        }
        Ok(())
    }

    fn cluster_instances(&self, key: &ClusterKey) -> Vec<ClusterInstance> {
        self.clusters.read().get(key).cloned().unwrap_or_default()
    }

    fn all_cluster_instances(&self) -> Vec<ClusterInstance> {
        self.clusters
            .read()
            .values()
            .flat_map(|instances| instances.iter().cloned())
            .collect()
    }
}
