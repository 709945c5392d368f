use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::auth::{auth_frame, AuthInfo};
use crate::metrics;
use crate::protocol::resp::{
    err_backend_unavailable, err_no_auth, err_pool_unavailable, err_wrong_pass, RespCodec,
    RespValue,
};
use crate::session::manager::{ForwardError, SessionManager};
use crate::session::{spawn_session, ClientId, ResponseContext, SessionHandle};

const IO_BUFFER: usize = 8 * 1024;
const LISTEN_BACKLOG: u32 = 1024;

/// RESP front-end: accepts clients, walks each one through the AUTH
/// phase and forwards authenticated traffic through the session manager.
pub struct ProxyServer {
    port: u16,
    /// sync router mode drops the username when relaying AUTH.
    strip_auth_username: bool,
    session_mgr: Arc<SessionManager>,
}

impl ProxyServer {
    pub fn new(
        port: u16,
        strip_auth_username: bool,
        session_mgr: Arc<SessionManager>,
    ) -> Arc<ProxyServer> {
        Arc::new(ProxyServer {
            port,
            strip_auth_username,
            session_mgr,
        })
    }

    pub fn session_mgr(&self) -> &Arc<SessionManager> {
        &self.session_mgr
    }

    /// Accept loop. Returns once `shutdown` fires and every pool and
    /// session has been dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = bind_reuse(self.port).context("failed to bind proxy listener")?;
        let local = listener.local_addr().context("listener has no address")?;
        info!(addr = %local, "proxy listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(socket, peer).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }

        info!("proxy shutting down, clearing sessions and pools");
        self.session_mgr.clear().await;
        Ok(())
    }

    pub async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        metrics::front_conn_open();
        if let Err(err) = socket.set_nodelay(true) {
            warn!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
        }

        let id = ClientId::next();
        let codec = RespCodec::default();
        let (read_half, write_half) = socket.into_split();
        let session = spawn_session(id, write_half, codec.clone());
        self.session_mgr.open_session(session.clone());
        debug!(session = %id, peer = %peer, "client connected");

        self.read_loop(read_half, &session, codec).await;

        self.session_mgr.close_session(id);
        metrics::front_conn_close();
        debug!(session = %id, peer = %peer, "client disconnected");
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf, session: &SessionHandle, codec: RespCodec) {
        let mut decoder = codec;
        let mut buf = BytesMut::with_capacity(IO_BUFFER);
        'conn: loop {
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => self.dispatch(session, frame).await,
                    Ok(None) => break,
                    Err(err) => {
                        // protocol errors are reported, then the
                        // connection is dropped
                        warn!(session = %session.id(), error = %err, "client protocol error");
                        metrics::global_error_incr();
                        session
                            .enqueue(ResponseContext::new(RespValue::error_msg(format!(
                                "ERR {err}"
                            ))))
                            .await;
                        break 'conn;
                    }
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(session = %session.id(), error = %err, "client read failed");
                    break;
                }
            }
        }
    }

    /// One frame from one client: AUTH phase first, then plain relay.
    ///
    /// ```text
    /// Client          Proxy          Backend
    ///   |--AUTH------->|              |
    ///   |              |--AUTH------->|
    ///   |              |<--OK---------|
    ///   |<--OK---------|              |
    ///   |--Command---->|              |
    ///   |              |--Command---->|
    ///   |              |<--Response---|
    ///   |<--Response---|              |
    /// ```
    async fn dispatch(&self, session: &SessionHandle, frame: RespValue) {
        if session.is_authenticated() {
            let auth = match session.auth_info() {
                Some(auth) => auth,
                None => return,
            };
            self.forward(session, frame, auth).await;
            return;
        }

        if !frame.is_auth_cmd() {
            metrics::auth_result("noauth");
            metrics::command("rejected");
            session.enqueue(ResponseContext::new(err_no_auth())).await;
            return;
        }

        let info = match AuthInfo::from_frame(&frame) {
            Some(info) => info,
            None => {
                metrics::auth_result("wrongpass");
                metrics::command("rejected");
                session.enqueue(ResponseContext::new(err_wrong_pass())).await;
                return;
            }
        };
        // tenant code zero or a code no backend serves is rejected
        // before anything reaches a backend
        if info.tenant_code == 0 || !self.session_mgr.backends().knows_tenant(&info) {
            metrics::auth_result("wrongpass");
            metrics::command("rejected");
            session.enqueue(ResponseContext::new(err_wrong_pass())).await;
            return;
        }

        session.set_auth_info(info.tentative());
        let outbound = if self.strip_auth_username {
            let password = info
                .password
                .clone()
                .expect("a parsed AUTH frame always carries a password");
            auth_frame(None, password)
        } else {
            frame
        };
        metrics::auth_result("relayed");
        self.forward(session, outbound, info).await;
    }

    async fn forward(&self, session: &SessionHandle, frame: RespValue, auth: AuthInfo) {
        let timer = metrics::forward_timer();
        let result = self.session_mgr.forward(session.id(), frame, auth).await;
        drop(timer);
        match result {
            Ok(()) => metrics::command("forwarded"),
            Err(err) => {
                metrics::command("error");
                warn!(session = %session.id(), error = %err, "forward failed");
                session
                    .enqueue(ResponseContext::new(reply_for(&err)))
                    .await;
            }
        }
    }
}

fn reply_for(err: &ForwardError) -> RespValue {
    match err {
        ForwardError::UnknownTenant => err_wrong_pass(),
        ForwardError::BackendUnavailable => err_backend_unavailable(),
        ForwardError::Pool => err_pool_unavailable(),
        ForwardError::SessionGone => RespValue::error_msg("ERR session is gone"),
    }
}

fn bind_reuse(port: u16) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad listen port"))?;
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
