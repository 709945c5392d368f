use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::AuthInfo;
use crate::cluster::router::{BackendRouter, Balancer};
use crate::cluster::{ClusterInstance, ClusterKey, ClusterStatus};

use super::fixed::FixedPool;
use super::pool::PoolOptions;

/// How long a freshly built pool may take to reach its warm floor before
/// it is exposed anyway.
const POOL_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown tenant")]
    UnknownTenant,
    #[error("no backend available")]
    NoBackend,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub pool_size: usize,
    pub max_idle: usize,
    pub fixed_pool: bool,
    /// `Some(addr)` pins every tenant to one static backend.
    pub static_addr: Option<String>,
}

/// Owns one FixedPool per live backend address and the tenant-code to
/// cluster-key mapping, both driven by registry events.
pub struct BackendManager {
    opts: ManagerOptions,
    router: Box<dyn BackendRouter>,
    balancer: Box<dyn Balancer>,
    pools: RwLock<HashMap<String, Arc<FixedPool>>>,
    tenants: RwLock<HashMap<u64, ClusterKey>>,
}

impl BackendManager {
    pub fn new(
        opts: ManagerOptions,
        router: Box<dyn BackendRouter>,
        balancer: Box<dyn Balancer>,
    ) -> Arc<BackendManager> {
        Arc::new(BackendManager {
            opts,
            router,
            balancer,
            pools: RwLock::new(HashMap::new()),
            tenants: RwLock::new(HashMap::new()),
        })
    }

    /// Consume registry events for the lifetime of the proxy.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ClusterInstance>,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            while let Some(instance) = events.recv().await {
                match instance.status {
                    ClusterStatus::Ready | ClusterStatus::Online => {
                        mgr.backend_online(instance).await;
                    }
                    ClusterStatus::Offline | ClusterStatus::Deleted => {
                        mgr.backend_offline(&instance).await;
                    }
                }
            }
            debug!("backend manager event loop done");
        })
    }

    async fn backend_online(&self, instance: ClusterInstance) {
        let addr = match instance.addr() {
            Some(addr) => addr,
            None => {
                warn!(id = %instance.id, "instance has no redis-port endpoint");
                return;
            }
        };
        if self.pools.read().contains_key(&addr) {
            debug!(backend = %addr, "backend already online");
            return;
        }
        let tenant_code = instance.key.tenant_code();
        info!(
            backend = %addr,
            tenant = tenant_code,
            tenant_key = %instance.key.tenant_key(),
            "backend online"
        );
        self.tenants
            .write()
            .insert(tenant_code, instance.key.clone());

        let pool = FixedPool::new(self.pool_options(&addr));
        if timeout(POOL_READY_TIMEOUT, pool.wait_ready()).await.is_err() {
            warn!(backend = %addr, "pool did not reach its warm floor in time");
        }
        self.pools.write().insert(addr, pool);
    }

    async fn backend_offline(&self, instance: &ClusterInstance) {
        let addr = match instance.addr() {
            Some(addr) => addr,
            None => return,
        };
        let pool = self.pools.write().remove(&addr);
        if let Some(pool) = pool {
            info!(backend = %addr, "backend offline");
            pool.close().await;
        }
    }

    fn pool_options(&self, addr: &str) -> PoolOptions {
        if self.opts.fixed_pool {
            PoolOptions::fixed(addr, self.opts.pool_size)
        } else {
            PoolOptions::standard(addr, self.opts.pool_size, self.opts.max_idle)
        }
    }

    /// Whether the given credentials map to some backend at all. Static
    /// mode accepts every tenant; sync mode requires a registered code.
    pub fn knows_tenant(&self, auth: &AuthInfo) -> bool {
        if self.opts.static_addr.is_some() {
            return true;
        }
        self.tenants.read().contains_key(&auth.tenant_code)
    }

    /// Resolve credentials to the pool serving that tenant.
    pub fn resolve_pool(&self, auth: &AuthInfo) -> Result<Arc<FixedPool>, ManagerError> {
        if let Some(static_addr) = &self.opts.static_addr {
            return self
                .pools
                .read()
                .get(static_addr)
                .cloned()
                .ok_or(ManagerError::NoBackend);
        }
        let key = self
            .tenants
            .read()
            .get(&auth.tenant_code)
            .cloned()
            .ok_or(ManagerError::UnknownTenant)?;
        let instance = self
            .router
            .select(self.balancer.as_ref(), &key)
            .map_err(|_| ManagerError::NoBackend)?;
        let addr = instance.addr().ok_or(ManagerError::NoBackend)?;
        self.pools
            .read()
            .get(&addr)
            .cloned()
            .ok_or(ManagerError::NoBackend)
    }

    pub async fn close(&self) {
        let pools: Vec<Arc<FixedPool>> = self
            .pools
            .write()
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.close().await;
        }
        self.tenants.write().clear();
    }
}
