pub mod manager;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Encoder;
use tracing::{debug, error};

use crate::auth::AuthInfo;
use crate::protocol::resp::{RespCodec, RespValue};

/// Bound of the per-session reply queue.
pub const SESSION_OUT_QUEUE: usize = 1024;

/// Sequential identifier for client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> ClientId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Stable byte key for consistent-hash placement.
    pub fn ring_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runs after a reply is dequeued and before it is written, on the
/// session's reply loop. Used to commit AUTH credentials once the
/// backend acknowledged them.
pub type SessionCallback = Box<dyn FnOnce(&SessionHandle) + Send>;

/// One reply travelling towards the client.
pub struct ResponseContext {
    pub response: RespValue,
    pub callback: Option<SessionCallback>,
}

impl ResponseContext {
    pub fn new(response: RespValue) -> ResponseContext {
        ResponseContext {
            response,
            callback: None,
        }
    }

    pub fn with_callback(response: RespValue, callback: SessionCallback) -> ResponseContext {
        ResponseContext {
            response,
            callback: Some(callback),
        }
    }
}

struct SessionShared {
    auth: RwLock<Option<AuthInfo>>,
    quit: watch::Sender<bool>,
}

/// Cheap-to-clone handle to a live client session. Backend connections
/// hold one only for the duration of an in-flight request.
#[derive(Clone)]
pub struct SessionHandle {
    id: ClientId,
    out_q: mpsc::Sender<ResponseContext>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared
            .auth
            .read()
            .as_ref()
            .map(AuthInfo::is_complete)
            .unwrap_or(false)
    }

    pub fn auth_info(&self) -> Option<AuthInfo> {
        self.shared.auth.read().clone()
    }

    pub fn set_auth_info(&self, info: AuthInfo) {
        *self.shared.auth.write() = Some(info);
    }

    /// Queue one reply for the client, applying backpressure when the
    /// reply loop is behind. Returns false once the session is gone.
    pub async fn enqueue(&self, ctx: ResponseContext) -> bool {
        self.out_q.send(ctx).await.is_ok()
    }

    /// Best-effort enqueue used on teardown paths that must not block.
    pub fn try_enqueue(&self, ctx: ResponseContext) -> bool {
        self.out_q.try_send(ctx).is_ok()
    }

    pub fn close(&self) {
        let _ = self.shared.quit.send(true);
    }

    /// A handle that is not backed by a client socket; replies land in
    /// the returned receiver. Used for backend pre-authentication.
    pub fn detached(id: ClientId) -> (SessionHandle, mpsc::Receiver<ResponseContext>) {
        let (tx, rx) = mpsc::channel(1);
        let (quit_tx, _quit_rx) = watch::channel(false);
        (
            SessionHandle {
                id,
                out_q: tx,
                shared: Arc::new(SessionShared {
                    auth: RwLock::new(None),
                    quit: quit_tx,
                }),
            },
            rx,
        )
    }
}

/// Spawn the reply loop for an accepted client and hand back its handle.
///
/// The loop executes reply callbacks, then writes and flushes in arrival
/// order. Write errors are logged and the loop keeps going; the read side
/// notices the broken socket and tears the session down.
pub fn spawn_session(id: ClientId, writer: OwnedWriteHalf, codec: RespCodec) -> SessionHandle {
    let (tx, rx) = mpsc::channel(SESSION_OUT_QUEUE);
    let (quit_tx, quit_rx) = watch::channel(false);
    let handle = SessionHandle {
        id,
        out_q: tx,
        shared: Arc::new(SessionShared {
            auth: RwLock::new(None),
            quit: quit_tx,
        }),
    };
    tokio::spawn(reply_loop(handle.clone(), writer, codec, rx, quit_rx));
    handle
}

async fn reply_loop(
    handle: SessionHandle,
    mut writer: OwnedWriteHalf,
    codec: RespCodec,
    mut rx: mpsc::Receiver<ResponseContext>,
    mut quit: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let ctx = tokio::select! {
            _ = quit.changed() => break,
            ctx = rx.recv() => match ctx {
                Some(ctx) => ctx,
                None => break,
            },
        };
        write_response(&handle, &mut writer, &codec, &mut buf, ctx).await;
    }
    // flush replies that were queued before the session went away
    while let Ok(ctx) = rx.try_recv() {
        write_response(&handle, &mut writer, &codec, &mut buf, ctx).await;
    }
    debug!(session = %handle.id(), "session reply loop done");
}

async fn write_response(
    handle: &SessionHandle,
    writer: &mut OwnedWriteHalf,
    codec: &RespCodec,
    buf: &mut BytesMut,
    ctx: ResponseContext,
) {
    if let Some(callback) = ctx.callback {
        callback(handle);
    }
    buf.clear();
    let mut encoder = codec.clone();
    if let Err(err) = encoder.encode(ctx.response, buf) {
        error!(session = %handle.id(), error = %err, "failed to encode reply");
        return;
    }
    if let Err(err) = writer.write_all(buf).await {
        error!(session = %handle.id(), error = %err, "failed to write reply to client");
        return;
    }
    if let Err(err) = writer.flush().await {
        error!(session = %handle.id(), error = %err, "failed to flush reply to client");
    }
}
