use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::protocol::resp::RespValue;

use super::check::probe_idle_socket;
use super::conn::{BackendConn, DEFAULT_QUEUE_SIZE};

/// Cap on the total time the background test-dial loop keeps probing an
/// unreachable backend.
const TEST_DIAL_MAX_ELAPSED: Duration = Duration::from_secs(30 * 60);
const TEST_DIAL_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("timed out waiting for a pool slot")]
    Timeout,
    #[error("dial failed: {0}")]
    Dial(String),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub addr: String,
    pub pool_size: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    pub max_active: usize,
    pub pool_wait_timeout: Duration,
    pub conn_max_lifetime: Option<Duration>,
    pub dial_timeout: Duration,
    pub queue_size: usize,
}

impl PoolOptions {
    /// Fixed population: the pool dials itself full and keeps it full.
    pub fn fixed(addr: impl Into<String>, pool_size: usize) -> PoolOptions {
        let pool_size = pool_size.max(1);
        PoolOptions {
            addr: addr.into(),
            pool_size,
            max_idle: pool_size,
            min_idle: pool_size,
            max_active: pool_size,
            pool_wait_timeout: Duration::from_secs(1),
            conn_max_lifetime: None,
            dial_timeout: Duration::from_secs(3),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    /// On-demand population with a small warm floor.
    pub fn standard(addr: impl Into<String>, pool_size: usize, max_idle: usize) -> PoolOptions {
        let pool_size = pool_size.max(1);
        PoolOptions {
            addr: addr.into(),
            pool_size,
            max_idle: max_idle.clamp(1, pool_size),
            min_idle: 1,
            max_active: pool_size,
            pool_wait_timeout: Duration::from_secs(1),
            conn_max_lifetime: None,
            dial_timeout: Duration::from_secs(3),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

#[derive(Clone)]
struct StoredCredential {
    username: Option<Bytes>,
    password: Bytes,
}

/// Credentials observed on the first successful AUTH through any conn of
/// the pool. Later-dialed connections pre-authenticate from here before
/// they serve traffic.
#[derive(Default)]
pub struct CredentialSlot {
    inner: RwLock<Option<StoredCredential>>,
}

impl CredentialSlot {
    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Record the exact shape of a successful AUTH request frame.
    pub fn seed_from_frame(&self, frame: &RespValue) {
        let items = match frame {
            RespValue::Array(items) if frame.is_auth_cmd() => items,
            _ => return,
        };
        let stored = match items.len() {
            2 => items[1].payload().map(|password| StoredCredential {
                username: None,
                password: Bytes::copy_from_slice(password),
            }),
            3 => match (items[1].payload(), items[2].payload()) {
                (Some(username), Some(password)) => Some(StoredCredential {
                    username: Some(Bytes::copy_from_slice(username)),
                    password: Bytes::copy_from_slice(password),
                }),
                _ => None,
            },
            _ => None,
        };
        if let Some(stored) = stored {
            *self.inner.write() = Some(stored);
        }
    }

    pub fn get(&self) -> Option<(Option<Bytes>, Bytes)> {
        self.inner
            .read()
            .as_ref()
            .map(|cred| (cred.username.clone(), cred.password.clone()))
    }
}

#[derive(Default)]
struct PoolCounters {
    immediate_gets: AtomicU64,
    delayed_gets: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub immediate_gets: u64,
    pub delayed_gets: u64,
    pub timeouts: u64,
    pub stale_conns: u64,
    pub conns: usize,
    pub idle_conns: usize,
}

struct PoolState {
    conns: Vec<Arc<BackendConn>>,
    idle: Vec<Arc<BackendConn>>,
    created: usize,
}

/// Slot-bounded pool of backend connections for one address.
pub struct BackendPool {
    opts: PoolOptions,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    err_nums: AtomicU32,
    last_dial_err: Mutex<Option<String>>,
    recovery_probe: AtomicBool,
    credential: Arc<CredentialSlot>,
    counters: PoolCounters,
}

impl BackendPool {
    pub fn new(opts: PoolOptions) -> Arc<BackendPool> {
        let pool = Arc::new(BackendPool {
            semaphore: Arc::new(Semaphore::new(opts.pool_size)),
            state: Mutex::new(PoolState {
                conns: Vec::with_capacity(opts.pool_size),
                idle: Vec::with_capacity(opts.pool_size),
                created: 0,
            }),
            closed: AtomicBool::new(false),
            err_nums: AtomicU32::new(0),
            last_dial_err: Mutex::new(None),
            recovery_probe: AtomicBool::new(false),
            credential: Arc::new(CredentialSlot::default()),
            counters: PoolCounters::default(),
            opts,
        });
        pool.check_min_idle();
        pool
    }

    pub fn addr(&self) -> &str {
        &self.opts.addr
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    pub fn credential(&self) -> Arc<CredentialSlot> {
        self.credential.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn conns_snapshot(&self) -> Vec<Arc<BackendConn>> {
        self.state.lock().conns.clone()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            immediate_gets: self.counters.immediate_gets.load(Ordering::Relaxed),
            delayed_gets: self.counters.delayed_gets.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            stale_conns: self.counters.stale_conns.load(Ordering::Relaxed),
            conns: state.conns.len(),
            idle_conns: state.idle.len(),
        }
    }

    /// Keep the warm floor populated. Dials run in the background, each
    /// holding a pool slot while it is in flight.
    pub fn check_min_idle(self: &Arc<Self>) {
        if self.opts.min_idle == 0 || self.is_closed() {
            return;
        }
        loop {
            {
                let state = self.state.lock();
                if state.created >= self.opts.pool_size || state.idle.len() >= self.opts.min_idle {
                    return;
                }
            }
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            {
                let mut state = self.state.lock();
                if state.created >= self.opts.pool_size {
                    return;
                }
                state.created += 1;
            }
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.dial_conn().await {
                    Ok(conn) => {
                        let adopted = {
                            let mut state = pool.state.lock();
                            if pool.is_closed() {
                                false
                            } else {
                                state.conns.push(conn.clone());
                                state.idle.push(conn.clone());
                                metrics::backend_conns(pool.addr(), state.conns.len());
                                metrics::pool_idle(pool.addr(), state.idle.len());
                                true
                            }
                        };
                        if !adopted {
                            // the pool closed while the dial was in flight
                            conn.close().await;
                        }
                    }
                    Err(err) => {
                        let mut state = pool.state.lock();
                        state.created = state.created.saturating_sub(1);
                        drop(state);
                        if !matches!(err, PoolError::Closed) {
                            warn!(backend = %pool.addr(), error = %err, "failed to add idle connection");
                        }
                    }
                }
                drop(permit);
            });
        }
    }

    /// Borrow a connection: idle first (LIFO), dial as a last resort.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = match timeout(
            self.opts.pool_wait_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::pool_acquisition(self.addr(), "timeout");
                return Err(PoolError::Timeout);
            }
        };

        loop {
            let candidate = self.state.lock().idle.pop();
            let conn = match candidate {
                Some(conn) => conn,
                None => break,
            };
            if self.healthy(&conn) {
                conn.touch();
                self.counters.immediate_gets.fetch_add(1, Ordering::Relaxed);
                metrics::pool_acquisition(self.addr(), "immediate");
                return Ok(PooledConn::new(conn, self.clone(), permit));
            }
            self.discard(&conn);
        }

        self.counters.delayed_gets.fetch_add(1, Ordering::Relaxed);
        metrics::pool_acquisition(self.addr(), "delayed");
        {
            let state = self.state.lock();
            if self.opts.max_active > 0 && state.created >= self.opts.max_active {
                return Err(PoolError::Exhausted);
            }
        }
        let conn = self.dial_conn().await?;
        {
            let mut state = self.state.lock();
            if self.is_closed() {
                drop(state);
                let closing = conn.clone();
                tokio::spawn(async move { closing.close().await });
                return Err(PoolError::Closed);
            }
            if self.opts.max_active > 0 && state.created >= self.opts.max_active {
                drop(state);
                let closing = conn.clone();
                tokio::spawn(async move { closing.close().await });
                return Err(PoolError::Exhausted);
            }
            state.conns.push(conn.clone());
            state.created += 1;
            metrics::backend_conns(self.addr(), state.conns.len());
        }
        Ok(PooledConn::new(conn, self.clone(), permit))
    }

    fn healthy(&self, conn: &Arc<BackendConn>) -> bool {
        if conn.is_closed() {
            return false;
        }
        if let Some(max_lifetime) = self.opts.conn_max_lifetime {
            if conn.created().elapsed() > max_lifetime {
                return false;
            }
            let now_secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let idle_for = now_secs.saturating_sub(conn.last_used_secs());
            if Duration::from_secs(idle_for) > max_lifetime {
                return false;
            }
        }
        probe_idle_socket(conn.stream()).is_healthy()
    }

    /// Remove a connection from the pool and close it.
    pub fn discard(self: &Arc<Self>, conn: &Arc<BackendConn>) {
        self.remove_tracking(conn);
        self.counters.stale_conns.fetch_add(1, Ordering::Relaxed);
        metrics::pool_stale(self.addr());
        let closing = conn.clone();
        tokio::spawn(async move { closing.close().await });
        self.check_min_idle();
    }

    fn remove_tracking(&self, conn: &Arc<BackendConn>) {
        let mut state = self.state.lock();
        if let Some(pos) = state.conns.iter().position(|c| c.id() == conn.id()) {
            state.conns.remove(pos);
            state.created = state.created.saturating_sub(1);
        }
        if let Some(pos) = state.idle.iter().position(|c| c.id() == conn.id()) {
            state.idle.remove(pos);
        }
        metrics::backend_conns(self.addr(), state.conns.len());
        metrics::pool_idle(self.addr(), state.idle.len());
    }

    fn release(self: &Arc<Self>, conn: Arc<BackendConn>) {
        if self.is_closed() || conn.is_closed() {
            self.remove_tracking(&conn);
            return;
        }
        let over_cap = {
            let mut state = self.state.lock();
            if self.opts.max_idle == 0 || state.idle.len() < self.opts.max_idle {
                state.idle.push(conn.clone());
                metrics::pool_idle(self.addr(), state.idle.len());
                false
            } else {
                true
            }
        };
        if over_cap {
            self.discard(&conn);
        }
    }

    async fn dial_conn(self: &Arc<Self>) -> Result<Arc<BackendConn>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.err_nums.load(Ordering::SeqCst) >= self.opts.pool_size as u32 {
            let last = self.last_dial_err.lock().clone();
            return Err(PoolError::Dial(
                last.unwrap_or_else(|| "backend repeatedly unreachable".to_string()),
            ));
        }
        let conn = match BackendConn::connect(
            &self.opts.addr,
            self.opts.dial_timeout,
            self.opts.queue_size,
            self.credential.clone(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                *self.last_dial_err.lock() = Some(err.to_string());
                self.err_nums.fetch_add(1, Ordering::SeqCst);
                metrics::backend_error(self.addr(), "dial");
                self.spawn_recovery_probe();
                return Err(PoolError::Dial(err.to_string()));
            }
        };
        self.err_nums.store(0, Ordering::SeqCst);

        if self.credential.is_set() {
            if let Err(err) = conn.ensure_auth().await {
                warn!(backend = %self.addr(), error = %err, "pre-authentication failed");
                metrics::backend_error(self.addr(), "preauth");
                conn.close().await;
                return Err(PoolError::Dial(format!("pre-authentication failed: {err}")));
            }
        }
        Ok(conn)
    }

    /// Once dials fail pool-size times in a row, stop dialing and probe
    /// with exponential backoff until the backend answers again.
    fn spawn_recovery_probe(self: &Arc<Self>) {
        if self.err_nums.load(Ordering::SeqCst) < self.opts.pool_size as u32 {
            return;
        }
        if self.recovery_probe.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut delay = Duration::from_secs(1);
            loop {
                if pool.is_closed() || started.elapsed() > TEST_DIAL_MAX_ELAPSED {
                    break;
                }
                sleep(delay).await;
                match BackendConn::connect(
                    &pool.opts.addr,
                    pool.opts.dial_timeout,
                    pool.opts.queue_size,
                    pool.credential.clone(),
                )
                .await
                {
                    Ok(probe) => {
                        info!(backend = %pool.addr(), "backend reachable again");
                        pool.err_nums.store(0, Ordering::SeqCst);
                        probe.close().await;
                        pool.check_min_idle();
                        break;
                    }
                    Err(err) => {
                        *pool.last_dial_err.lock() = Some(err.to_string());
                        delay = (delay * 2).min(TEST_DIAL_MAX_DELAY);
                    }
                }
            }
            pool.recovery_probe.store(false, Ordering::SeqCst);
        });
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns: Vec<Arc<BackendConn>> = {
            let mut state = self.state.lock();
            state.idle.clear();
            state.created = 0;
            state.conns.drain(..).collect()
        };
        for conn in conns {
            conn.close().await;
        }
        metrics::backend_conns(self.addr(), 0);
        metrics::pool_idle(self.addr(), 0);
        debug!(backend = %self.addr(), "backend pool closed");
    }
}

/// A borrowed connection. Dropping it returns the connection to the idle
/// list and frees the pool slot.
pub struct PooledConn {
    conn: Arc<BackendConn>,
    pool: Arc<BackendPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl PooledConn {
    fn new(conn: Arc<BackendConn>, pool: Arc<BackendPool>, permit: OwnedSemaphorePermit) -> Self {
        PooledConn {
            conn,
            pool,
            _permit: permit,
        }
    }

    pub fn conn(&self) -> &Arc<BackendConn> {
        &self.conn
    }
}

impl Deref for PooledConn {
    type Target = BackendConn;

    fn deref(&self) -> &BackendConn {
        &self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts connections and keeps them open without answering.
    async fn silent_backend() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let handle = tokio::spawn(async move {
                            let mut socket = socket;
                            let mut buf = [0u8; 1024];
                            while let Ok(n) = socket.read(&mut buf).await {
                                if n == 0 {
                                    break;
                                }
                            }
                        });
                        held.push(handle);
                    }
                    Err(_) => break,
                }
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn fills_to_min_idle() {
        let (addr, _backend) = silent_backend().await;
        let pool = BackendPool::new(PoolOptions::fixed(addr, 3));
        timeout(Duration::from_secs(5), async {
            while pool.size() < 3 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pool must dial itself full");
        assert_eq!(pool.status().conns, 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn get_prefers_idle_lifo_and_put_returns() {
        let (addr, _backend) = silent_backend().await;
        let pool = BackendPool::new(PoolOptions::fixed(addr, 2));
        timeout(Duration::from_secs(5), async {
            while pool.size() < 2 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let first = pool.get().await.unwrap();
        let first_id = first.id();
        drop(first);
        let again = pool.get().await.unwrap();
        // LIFO: the most recently returned conn is handed out first
        assert_eq!(again.id(), first_id);
        assert!(pool.status().immediate_gets >= 2);
        drop(again);
        pool.close().await;
    }

    #[tokio::test]
    async fn slot_exhaustion_times_out() {
        let (addr, _backend) = silent_backend().await;
        let mut opts = PoolOptions::fixed(addr, 1);
        opts.pool_wait_timeout = Duration::from_millis(100);
        let pool = BackendPool::new(opts);
        timeout(Duration::from_secs(5), async {
            while pool.size() < 1 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let held = pool.get().await.unwrap();
        let err = pool.get().await.expect_err("no slot free");
        assert!(matches!(err, PoolError::Timeout));
        assert_eq!(pool.status().timeouts, 1);
        drop(held);
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_rejects_gets() {
        let (addr, _backend) = silent_backend().await;
        let pool = BackendPool::new(PoolOptions::fixed(addr, 1));
        pool.close().await;
        assert!(matches!(pool.get().await, Err(PoolError::Closed)));
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_and_trips_recovery() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut opts = PoolOptions::fixed(addr, 1);
        opts.min_idle = 0; // no background fill; drive dials through get()
        opts.pool_wait_timeout = Duration::from_millis(200);
        let pool = BackendPool::new(opts);
        let err = pool.get().await.expect_err("dial must fail");
        assert!(matches!(err, PoolError::Dial(_)));
        // consecutive failures reached pool_size: dials now fast-fail
        let err = pool.get().await.expect_err("fast failure");
        assert!(matches!(err, PoolError::Dial(_)));
        pool.close().await;
    }

    #[test]
    fn credential_slot_stores_both_auth_shapes() {
        use crate::auth::auth_frame;

        let slot = CredentialSlot::default();
        assert!(!slot.is_set());
        slot.seed_from_frame(&auth_frame(None, Bytes::from_static(b"pw")));
        let (username, password) = slot.get().unwrap();
        assert!(username.is_none());
        assert_eq!(password.as_ref(), b"pw");

        slot.seed_from_frame(&auth_frame(
            Some(Bytes::from_static(b"tenant.admin")),
            Bytes::from_static(b"pw2"),
        ));
        let (username, password) = slot.get().unwrap();
        assert_eq!(username.as_deref(), Some(&b"tenant.admin"[..]));
        assert_eq!(password.as_ref(), b"pw2");

        // non-AUTH frames never seed credentials
        slot.seed_from_frame(&RespValue::command_frame([
            Bytes::from_static(b"GET"),
            Bytes::from_static(b"k"),
        ]));
        assert!(slot.get().is_some());
    }
}
