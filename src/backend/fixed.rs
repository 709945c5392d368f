use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::conn::BackendConn;
use super::pool::{BackendPool, CredentialSlot, PoolOptions};
use super::ring::HashRing;

const READY_POLL: Duration = Duration::from_millis(50);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed population of backend connections with consistent-hash sticky
/// placement. Sessions hash onto members; members inside a foreign
/// transaction window are dodged via `no_tx_conn`.
pub struct FixedPool {
    inner: Arc<BackendPool>,
    online: RwLock<HashMap<u64, Arc<BackendConn>>>,
    ring: RwLock<HashRing>,
    ready: AtomicBool,
    quit: watch::Sender<bool>,
}

impl FixedPool {
    pub fn new(opts: PoolOptions) -> Arc<FixedPool> {
        let (quit_tx, quit_rx) = watch::channel(false);
        let pool = Arc::new(FixedPool {
            inner: BackendPool::new(opts),
            online: RwLock::new(HashMap::new()),
            ring: RwLock::new(HashRing::new()),
            ready: AtomicBool::new(false),
            quit: quit_tx,
        });
        tokio::spawn(sweep_loop(pool.clone(), quit_rx));
        pool
    }

    pub fn addr(&self) -> &str {
        self.inner.addr()
    }

    pub fn inner(&self) -> &Arc<BackendPool> {
        &self.inner
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn credential(&self) -> Arc<CredentialSlot> {
        self.inner.credential()
    }

    /// Block until the population reached its warm floor, then seed the
    /// ring and flip the ready flag. Members dialed later are adopted by
    /// the sweep loop.
    pub async fn wait_ready(&self) {
        let target = self.inner.options().min_idle.max(1);
        let mut ticker = interval(READY_POLL);
        loop {
            ticker.tick().await;
            if self.inner.is_closed() {
                return;
            }
            if self.inner.size() >= target {
                let conns = self.inner.conns_snapshot();
                {
                    let mut online = self.online.write();
                    let mut ring = self.ring.write();
                    for conn in conns {
                        ring.add(conn.id());
                        online.insert(conn.id(), conn);
                    }
                }
                self.ready.store(true, Ordering::SeqCst);
                info!(backend = %self.addr(), size = target, "backend pool ready");
                return;
            }
        }
    }

    /// Sticky member for a session key. Stable while membership is
    /// unchanged.
    pub fn conn_for_key(&self, key: &[u8]) -> Option<Arc<BackendConn>> {
        let member = self.ring.read().locate(key)?;
        self.online.read().get(&member).cloned()
    }

    /// Uniformly random member not inside an open transaction window.
    pub fn no_tx_conn(&self) -> Option<Arc<BackendConn>> {
        let candidates: Vec<Arc<BackendConn>> = self
            .online
            .read()
            .values()
            .filter(|conn| !conn.is_closed() && conn.tx_available())
            .cloned()
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn close(&self) {
        let _ = self.quit.send(true);
        self.inner.close().await;
        self.online.write().clear();
        *self.ring.write() = HashRing::new();
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// Replace members that died: drop them from ring and membership, let
/// the inner pool redial, then adopt the replacements.
async fn sweep_loop(pool: Arc<FixedPool>, mut quit: watch::Receiver<bool>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            _ = ticker.tick() => {}
        }
        if pool.inner.is_closed() {
            break;
        }
        if !pool.is_ready() {
            continue;
        }

        let dead: Vec<Arc<BackendConn>> = pool
            .online
            .read()
            .values()
            .filter(|conn| conn.is_closed())
            .cloned()
            .collect();
        for conn in dead {
            warn!(backend = %pool.addr(), conn = conn.id(), "replacing dead pool member");
            {
                let mut online = pool.online.write();
                let mut ring = pool.ring.write();
                online.remove(&conn.id());
                ring.remove(conn.id());
            }
            pool.inner.discard(&conn);
        }

        // adopt replacements dialed by the inner pool
        let candidates = pool.inner.conns_snapshot();
        let mut online = pool.online.write();
        let mut ring = pool.ring.write();
        for conn in candidates {
            if !conn.is_closed() && !online.contains_key(&conn.id()) {
                debug!(backend = %pool.addr(), conn = conn.id(), "adopting new pool member");
                ring.add(conn.id());
                online.insert(conn.id(), conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    use crate::session::{ClientId, SessionHandle};

    async fn silent_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        tokio::spawn(async move {
                            let mut socket = socket;
                            let mut buf = [0u8; 1024];
                            while let Ok(n) = socket.read(&mut buf).await {
                                if n == 0 {
                                    break;
                                }
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        addr
    }

    async fn ready_pool(size: usize) -> Arc<FixedPool> {
        let addr = silent_backend().await;
        let pool = FixedPool::new(PoolOptions::fixed(addr, size));
        timeout(Duration::from_secs(5), pool.wait_ready())
            .await
            .expect("pool must become ready");
        pool
    }

    #[tokio::test]
    async fn sticky_selection_is_stable() {
        let pool = ready_pool(4).await;
        let key = ClientId::next().ring_key();
        let first = pool.conn_for_key(&key).unwrap();
        for _ in 0..16 {
            assert_eq!(pool.conn_for_key(&key).unwrap().id(), first.id());
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn no_tx_conn_avoids_open_transactions() {
        let pool = ready_pool(2).await;
        let (owner, _rx) = SessionHandle::detached(ClientId::next());

        let conns = pool.inner().conns_snapshot();
        conns[0].begin_tx(owner.clone());

        for _ in 0..16 {
            let picked = pool.no_tx_conn().expect("one member is free");
            assert_eq!(picked.id(), conns[1].id());
        }

        // both busy: nothing to hand out
        conns[1].begin_tx(owner.clone());
        assert!(pool.no_tx_conn().is_none());

        // an ended window is usable again
        conns[0].end_tx();
        assert_eq!(pool.no_tx_conn().unwrap().id(), conns[0].id());
        pool.close().await;
    }

    #[tokio::test]
    async fn sweep_replaces_dead_members() {
        let pool = ready_pool(2).await;
        let victim = pool.inner().conns_snapshot()[0].clone();
        victim.close().await;

        timeout(Duration::from_secs(10), async {
            loop {
                let online = pool.online.read();
                if online.len() == 2 && !online.contains_key(&victim.id()) {
                    break;
                }
                drop(online);
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("sweep must replace the dead member");
        pool.close().await;
    }

    #[tokio::test]
    async fn close_empties_everything() {
        let pool = ready_pool(2).await;
        pool.close().await;
        assert!(!pool.is_ready());
        assert!(pool.conn_for_key(b"any").is_none());
        assert!(pool.no_tx_conn().is_none());
        assert_eq!(pool.inner().size(), 0);
    }
}
