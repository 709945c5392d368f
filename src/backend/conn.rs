use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::auth::{auth_frame, AuthInfo};
use crate::metrics;
use crate::protocol::resp::{err_backend_unavailable, RespCodec, RespValue, TxKind};
use crate::session::{ClientId, ResponseContext, SessionHandle};
use crate::utils::is_backend_unavailable;

use super::pool::CredentialSlot;

/// Queue bound shared by the write queue and the in-flight FIFO.
pub const DEFAULT_QUEUE_SIZE: usize = 128;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const AUTH_RELAY_TIMEOUT: Duration = Duration::from_millis(500);
const IO_BUFFER: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("backend is unavailable")]
    Unavailable,
    #[error("authentication timeout")]
    AuthTimeout,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
}

/// One request travelling towards a backend.
pub struct RequestContext {
    pub session: SessionHandle,
    pub request: RespValue,
    pub auth_info: Option<AuthInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// MULTI/WATCH seen; queued replies stream to the owner.
    Begin,
    /// EXEC/DISCARD forwarded; cleared when its reply arrives.
    End,
}

struct TxState {
    owner: SessionHandle,
    phase: TxPhase,
}

/// In-flight FIFO entry, pushed in write order. Replies are matched
/// strictly head-of-queue: request entries deliver to the submitting
/// session, transaction markers deliver to the transaction owner.
enum InFlight {
    Request(RequestContext),
    TxReply(SessionHandle),
}

/// One pipelined TCP connection to one backend. Exactly one writer loop
/// and one reader loop run per connection.
pub struct BackendConn {
    id: u64,
    addr: String,
    stream: TcpStream,
    codec: RespCodec,
    write_tx: mpsc::Sender<RequestContext>,
    tx_state: RwLock<Option<TxState>>,
    closed: AtomicBool,
    quit: watch::Sender<bool>,
    created: Instant,
    last_used: AtomicU64,
    credential: Arc<CredentialSlot>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackendConn {
    /// Dial a backend and spawn the two connection loops.
    pub async fn connect(
        addr: &str,
        dial_timeout: Duration,
        queue_size: usize,
        credential: Arc<CredentialSlot>,
    ) -> io::Result<Arc<BackendConn>> {
        let stream = dial(addr, dial_timeout).await?;
        stream.set_nodelay(true)?;

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (write_tx, write_rx) = mpsc::channel(queue_size);
        let (inflight_tx, inflight_rx) = mpsc::channel(queue_size);
        let (quit_tx, quit_rx) = watch::channel(false);

        let conn = Arc::new(BackendConn {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.to_string(),
            stream,
            codec: RespCodec::default(),
            write_tx,
            tx_state: RwLock::new(None),
            closed: AtomicBool::new(false),
            quit: quit_tx,
            created: Instant::now(),
            last_used: AtomicU64::new(unix_seconds()),
            credential,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_loop(
            conn.clone(),
            write_rx,
            inflight_tx,
            quit_rx.clone(),
        ));
        let reader = tokio::spawn(read_loop(conn.clone(), inflight_rx, quit_rx));
        conn.tasks.lock().extend([writer, reader]);
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_used_secs(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_used.store(unix_seconds(), Ordering::Relaxed);
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Submit one request. Applies backpressure when the write queue is
    /// full; fails once the connection is closed.
    pub async fn enqueue(&self, ctx: RequestContext) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Unavailable);
        }
        self.write_tx
            .send(ctx)
            .await
            .map_err(|_| ConnError::Unavailable)
    }

    /// Owner and phase of the active transaction window, if any.
    pub fn tx_owner(&self) -> Option<(ClientId, TxPhase)> {
        self.tx_state
            .read()
            .as_ref()
            .map(|state| (state.owner.id(), state.phase))
    }

    /// Whether a foreign session may share this connection right now.
    pub fn tx_available(&self) -> bool {
        match self.tx_state.read().as_ref() {
            None => true,
            Some(state) => state.phase == TxPhase::End,
        }
    }

    pub fn begin_tx(&self, owner: SessionHandle) {
        *self.tx_state.write() = Some(TxState {
            owner,
            phase: TxPhase::Begin,
        });
    }

    /// Mark the window closing; ownership is kept until the terminator's
    /// reply clears it.
    pub fn end_tx(&self) {
        if let Some(state) = self.tx_state.write().as_mut() {
            state.phase = TxPhase::End;
        }
    }

    pub fn clear_tx(&self) {
        *self.tx_state.write() = None;
    }

    /// Authenticate this connection from the pool credential slot, end
    /// to end through the normal pipeline.
    pub async fn ensure_auth(&self) -> Result<(), ConnError> {
        let (username, password) = match self.credential.get() {
            Some(parts) => parts,
            None => return Ok(()),
        };
        let (handle, mut rx) = SessionHandle::detached(ClientId::next());
        self.enqueue(RequestContext {
            session: handle,
            request: auth_frame(username, password),
            auth_info: None,
        })
        .await?;
        match timeout(AUTH_RELAY_TIMEOUT, rx.recv()).await {
            Ok(Some(ctx)) if ctx.response.is_ok_status() => Ok(()),
            Ok(Some(ctx)) => Err(ConnError::AuthRejected(format!("{:?}", ctx.response))),
            Ok(None) => Err(ConnError::Unavailable),
            Err(_) => Err(ConnError::AuthTimeout),
        }
    }

    /// Flip the closed flag and wake both loops. Idempotent.
    pub fn begin_teardown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.quit.send(true);
            debug!(backend = %self.addr, conn = self.id, "backend connection tearing down");
        }
    }

    /// Tear down and wait for the loops, bounded by a join timeout. The
    /// socket closes once the loops have dropped their handles.
    pub async fn close(&self) {
        self.begin_teardown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!(backend = %self.addr, conn = self.id, "connection loop join timed out");
            }
        }
    }

    fn classify_in_flight(&self, ctx: RequestContext) -> InFlight {
        let guard = self.tx_state.read();
        match guard.as_ref() {
            None => InFlight::Request(ctx),
            Some(state) => {
                if ctx.request.tx_kind() == Some(TxKind::End) {
                    // the terminator matches the final reply via the FIFO
                    InFlight::Request(ctx)
                } else if state.owner.id() == ctx.session.id() {
                    InFlight::TxReply(state.owner.clone())
                } else {
                    // a foreign request that was queued before the window
                    // opened; it still matches its own session
                    InFlight::Request(ctx)
                }
            }
        }
    }

    async fn route_reply(
        &self,
        frame: RespValue,
        inflight_rx: &mut mpsc::Receiver<InFlight>,
        quit: &mut watch::Receiver<bool>,
    ) -> bool {
        // The matching entry may still be a beat behind the reply; wait
        // for it rather than dropping the frame.
        let entry = tokio::select! {
            _ = quit.changed() => return false,
            entry = inflight_rx.recv() => match entry {
                Some(entry) => entry,
                None => return false,
            },
        };
        match entry {
            InFlight::TxReply(owner) => {
                let _ = owner.enqueue(ResponseContext::new(frame)).await;
            }
            InFlight::Request(ctx) => {
                if ctx.request.tx_kind() == Some(TxKind::End) {
                    let owned_by_ctx = self
                        .tx_owner()
                        .map(|(owner, _)| owner == ctx.session.id())
                        .unwrap_or(false);
                    if owned_by_ctx {
                        self.clear_tx();
                    }
                }
                let response = if ctx.request.is_auth_cmd() && frame.is_ok_status() {
                    self.credential.seed_from_frame(&ctx.request);
                    match ctx.auth_info.clone() {
                        Some(info) => ResponseContext::with_callback(
                            frame,
                            Box::new(move |session| session.set_auth_info(info)),
                        ),
                        None => ResponseContext::new(frame),
                    }
                } else {
                    if ctx.request.is_auth_cmd() {
                        debug!(backend = %self.addr, conn = self.id, "backend rejected AUTH");
                    }
                    ResponseContext::new(frame)
                };
                let _ = ctx.session.enqueue(response).await;
            }
        }
        true
    }
}

async fn dial(addr: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
    let target = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))?;
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    match timeout(dial_timeout, socket.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "backend dial timed out")),
    }
}

async fn write_all_stream(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn write_loop(
    conn: Arc<BackendConn>,
    mut write_rx: mpsc::Receiver<RequestContext>,
    inflight_tx: mpsc::Sender<InFlight>,
    mut quit: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(IO_BUFFER);
    loop {
        let ctx = tokio::select! {
            _ = quit.changed() => break,
            ctx = write_rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => break,
            },
        };
        buf.clear();
        conn.codec.encode_command(&ctx.request, &mut buf);
        match write_all_stream(conn.stream(), &buf).await {
            Ok(()) => {
                conn.touch();
                let entry = conn.classify_in_flight(ctx);
                if inflight_tx.send(entry).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let unavailable = is_backend_unavailable(&err);
                warn!(backend = %conn.addr(), conn = conn.id(), error = %err, "backend write failed");
                metrics::backend_error(conn.addr(), "write");
                let reply = if unavailable {
                    err_backend_unavailable()
                } else {
                    RespValue::error_msg(format!("ERR {err}"))
                };
                let _ = ctx.session.enqueue(ResponseContext::new(reply)).await;
                if unavailable {
                    conn.begin_teardown();
                    break;
                }
            }
        }
    }
    drain_write_queue(&mut write_rx);
    debug!(backend = %conn.addr(), conn = conn.id(), "backend write loop done");
}

fn drain_write_queue(write_rx: &mut mpsc::Receiver<RequestContext>) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Ok(ctx) = write_rx.try_recv() {
        if Instant::now() > deadline {
            warn!("write queue drain timed out");
            break;
        }
        let _ = ctx
            .session
            .try_enqueue(ResponseContext::new(err_backend_unavailable()));
    }
}

async fn read_loop(
    conn: Arc<BackendConn>,
    mut inflight_rx: mpsc::Receiver<InFlight>,
    mut quit: watch::Receiver<bool>,
) {
    let mut codec = RespCodec::default();
    let mut buf = BytesMut::with_capacity(IO_BUFFER);
    'outer: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    if !conn.route_reply(frame, &mut inflight_rx, &mut quit).await {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(backend = %conn.addr(), conn = conn.id(), error = %err, "bad frame from backend");
                    metrics::backend_error(conn.addr(), "protocol");
                    conn.begin_teardown();
                    break 'outer;
                }
            }
        }
        tokio::select! {
            _ = quit.changed() => break,
            ready = conn.stream().readable() => {
                if let Err(err) = ready {
                    warn!(backend = %conn.addr(), conn = conn.id(), error = %err, "backend socket failed");
                    metrics::backend_error(conn.addr(), "read");
                    conn.begin_teardown();
                    break;
                }
                match conn.stream().try_read_buf(&mut buf) {
                    Ok(0) => {
                        debug!(backend = %conn.addr(), conn = conn.id(), "backend closed the connection");
                        metrics::backend_error(conn.addr(), "eof");
                        conn.begin_teardown();
                        break;
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(backend = %conn.addr(), conn = conn.id(), error = %err, "backend read failed");
                        metrics::backend_error(conn.addr(), "read");
                        if is_backend_unavailable(&err) {
                            conn.begin_teardown();
                            break;
                        }
                    }
                }
            }
        }
    }
    drain_in_flight(&mut inflight_rx);
    conn.clear_tx();
    debug!(backend = %conn.addr(), conn = conn.id(), "backend read loop done");
}

fn drain_in_flight(inflight_rx: &mut mpsc::Receiver<InFlight>) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Ok(entry) = inflight_rx.try_recv() {
        if Instant::now() > deadline {
            warn!("in-flight queue drain timed out");
            break;
        }
        let ctx = ResponseContext::new(err_backend_unavailable());
        match entry {
            InFlight::Request(request) => {
                let _ = request.session.try_enqueue(ctx);
            }
            InFlight::TxReply(owner) => {
                let _ = owner.try_enqueue(ctx);
            }
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
