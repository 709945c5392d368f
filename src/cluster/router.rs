use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use super::registry::ClusterRegistry;
use super::{ClusterInstance, ClusterKey};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no backend available for cluster")]
    NoBackend,
}

/// Spreads a tenant's sessions over the instances of its cluster.
pub trait Balancer: Send + Sync {
    fn next(&self, key: &ClusterKey, instances: &[ClusterInstance]) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    Random,
    RoundRobin,
    LeastConn,
}

impl BalancerKind {
    pub fn parse(value: &str) -> Option<BalancerKind> {
        match value.to_ascii_lowercase().as_str() {
            "random" => Some(BalancerKind::Random),
            "round-robin" => Some(BalancerKind::RoundRobin),
            "least-conn" => Some(BalancerKind::LeastConn),
            _ => None,
        }
    }
}

pub fn new_balancer(kind: BalancerKind) -> Box<dyn Balancer> {
    match kind {
        BalancerKind::Random => Box::new(RandomBalancer),
        BalancerKind::RoundRobin => Box::new(RoundRobinBalancer::default()),
        BalancerKind::LeastConn => {
            // TODO: wire pool occupancy into the selector; round-robin is
            // the closest behavior until then.
            warn!("least-conn balancer not implemented, using round-robin");
            Box::new(RoundRobinBalancer::default())
        }
    }
}

pub struct RandomBalancer;

impl Balancer for RandomBalancer {
    fn next(&self, _key: &ClusterKey, instances: &[ClusterInstance]) -> usize {
        rand::thread_rng().gen_range(0..instances.len())
    }
}

#[derive(Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
}

impl Balancer for RoundRobinBalancer {
    fn next(&self, _key: &ClusterKey, instances: &[ClusterInstance]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len()
    }
}

/// Resolves a cluster key to one serving instance.
pub trait BackendRouter: Send + Sync {
    fn select(
        &self,
        balancer: &dyn Balancer,
        key: &ClusterKey,
    ) -> Result<ClusterInstance, RouteError>;

    fn list(&self, key: &ClusterKey) -> Vec<ClusterInstance>;
}

/// Fixed single-backend router (`--router.type static`).
pub struct StaticRouter {
    instance: ClusterInstance,
}

impl StaticRouter {
    pub fn new(instance: ClusterInstance) -> StaticRouter {
        StaticRouter { instance }
    }

    pub fn instance(&self) -> &ClusterInstance {
        &self.instance
    }
}

impl BackendRouter for StaticRouter {
    fn select(
        &self,
        _balancer: &dyn Balancer,
        _key: &ClusterKey,
    ) -> Result<ClusterInstance, RouteError> {
        Ok(self.instance.clone())
    }

    fn list(&self, _key: &ClusterKey) -> Vec<ClusterInstance> {
        vec![self.instance.clone()]
    }
}

/// Registry-backed router (`--router.type sync`).
pub struct SyncRouter {
    registry: Arc<dyn ClusterRegistry>,
}

impl SyncRouter {
    pub fn new(registry: Arc<dyn ClusterRegistry>) -> SyncRouter {
        SyncRouter { registry }
    }
}

impl BackendRouter for SyncRouter {
    fn select(
        &self,
        balancer: &dyn Balancer,
        key: &ClusterKey,
    ) -> Result<ClusterInstance, RouteError> {
        let instances: Vec<ClusterInstance> = self
            .registry
            .cluster_instances(key)
            .into_iter()
            .filter(|instance| instance.status.is_serving())
            .collect();
        match instances.len() {
            0 => Err(RouteError::NoBackend),
            1 => Ok(instances.into_iter().next().expect("len checked")),
            _ => {
                let idx = balancer.next(key, &instances);
                Ok(instances
                    .into_iter()
                    .nth(idx)
                    .ok_or(RouteError::NoBackend)?)
            }
        }
    }

    fn list(&self, key: &ClusterKey) -> Vec<ClusterInstance> {
        self.registry.cluster_instances(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::InMemoryClusterRegistry;
    use crate::cluster::ClusterStatus;

    fn instances(n: usize) -> Vec<ClusterInstance> {
        (0..n)
            .map(|i| {
                let mut instance = ClusterInstance::local("127.0.0.1", 6379 + i as u16);
                instance.id = format!("node-{i}");
                instance
            })
            .collect()
    }

    #[test]
    fn balancer_kind_parsing() {
        assert_eq!(BalancerKind::parse("random"), Some(BalancerKind::Random));
        assert_eq!(
            BalancerKind::parse("Round-Robin"),
            Some(BalancerKind::RoundRobin)
        );
        assert_eq!(
            BalancerKind::parse("least-conn"),
            Some(BalancerKind::LeastConn)
        );
        assert_eq!(BalancerKind::parse("weighted"), None);
    }

    #[test]
    fn round_robin_cycles() {
        let balancer = RoundRobinBalancer::default();
        let list = instances(3);
        let key = list[0].key.clone();
        let picks: Vec<usize> = (0..6).map(|_| balancer.next(&key, &list)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let balancer = RandomBalancer;
        let list = instances(4);
        let key = list[0].key.clone();
        for _ in 0..64 {
            assert!(balancer.next(&key, &list) < list.len());
        }
    }

    #[test]
    fn sync_router_skips_non_serving_instances() {
        let (registry, _events) = InMemoryClusterRegistry::new();
        let mut list = instances(2);
        registry.add_cluster(list[0].key.clone());
        list[1].status = ClusterStatus::Offline;
        for instance in &list {
            registry.status_change(instance.clone()).unwrap();
        }
        let router = SyncRouter::new(registry);
        let picked = router
            .select(&RandomBalancer, &list[0].key)
            .expect("one serving instance");
        assert_eq!(picked.id, "node-0");
    }

    #[test]
    fn sync_router_errors_without_backends() {
        let (registry, _events) = InMemoryClusterRegistry::new();
        let key = ClusterInstance::local("127.0.0.1", 6379).key;
        let router = SyncRouter::new(registry);
        assert!(matches!(
            router.select(&RandomBalancer, &key),
            Err(RouteError::NoBackend)
        ));
    }
}
