use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::auth::AuthInfo;
use crate::backend::conn::{BackendConn, RequestContext, TxPhase};
use crate::backend::manager::{BackendManager, ManagerError};
use crate::protocol::resp::{RespValue, TxKind};

use super::{ClientId, SessionHandle};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("unknown tenant")]
    UnknownTenant,
    #[error("backend is unavailable")]
    BackendUnavailable,
    #[error("can not get backend connection from pool")]
    Pool,
    #[error("session not found")]
    SessionGone,
}

struct SessionPair {
    session: SessionHandle,
    backend: Option<Arc<BackendConn>>,
}

/// Tracks live sessions and their current backend binding, and carries
/// one request from a session onto a backend write queue.
pub struct SessionManager {
    sessions: RwLock<HashMap<u64, SessionPair>>,
    backends: Arc<BackendManager>,
}

impl SessionManager {
    pub fn new(backends: Arc<BackendManager>) -> Arc<SessionManager> {
        Arc::new(SessionManager {
            sessions: RwLock::new(HashMap::new()),
            backends,
        })
    }

    pub fn backends(&self) -> &Arc<BackendManager> {
        &self.backends
    }

    pub fn open_session(&self, session: SessionHandle) {
        self.sessions.write().insert(
            session.id().as_u64(),
            SessionPair {
                session,
                backend: None,
            },
        );
    }

    pub fn close_session(&self, id: ClientId) {
        if let Some(pair) = self.sessions.write().remove(&id.as_u64()) {
            pair.session.close();
            debug!(session = %id, "session closed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Bind (or rebind) a backend for this request and enqueue it.
    pub async fn forward(
        &self,
        id: ClientId,
        frame: RespValue,
        auth: AuthInfo,
    ) -> Result<(), ForwardError> {
        let (session, bound) = {
            let sessions = self.sessions.read();
            let pair = sessions
                .get(&id.as_u64())
                .ok_or(ForwardError::SessionGone)?;
            (pair.session.clone(), pair.backend.clone())
        };

        // Keep the bound conn while its window is idle or ours.
        let keep = match &bound {
            Some(conn) if !conn.is_closed() => match conn.tx_owner() {
                None => true,
                Some((owner, _)) => owner == id,
            },
            _ => false,
        };
        let conn = if keep {
            bound.expect("keep implies a bound backend")
        } else {
            self.rebind(id, &auth).await?
        };

        match frame.tx_kind() {
            Some(TxKind::Begin) => conn.begin_tx(session.clone()),
            Some(TxKind::End) => conn.end_tx(),
            None => {}
        }

        conn.enqueue(RequestContext {
            session,
            request: frame,
            auth_info: Some(auth),
        })
        .await
        .map_err(|_| ForwardError::BackendUnavailable)
    }

    async fn rebind(&self, id: ClientId, auth: &AuthInfo) -> Result<Arc<BackendConn>, ForwardError> {
        let pool = self.backends.resolve_pool(auth).map_err(|err| match err {
            ManagerError::UnknownTenant => ForwardError::UnknownTenant,
            ManagerError::NoBackend => ForwardError::BackendUnavailable,
        })?;

        let mut conn = pool
            .conn_for_key(&id.ring_key())
            .ok_or(ForwardError::Pool)?;

        let occupied = conn.is_closed()
            || matches!(
                conn.tx_owner(),
                Some((owner, TxPhase::Begin)) if owner != id
            );
        if occupied {
            debug!(session = %id, conn = conn.id(), "sticky backend occupied, using no-tx fallback");
            // wait out short transaction windows before failing the request
            let deadline =
                tokio::time::Instant::now() + pool.inner().options().pool_wait_timeout;
            conn = loop {
                if let Some(free) = pool.no_tx_conn() {
                    break free;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ForwardError::Pool);
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            };
        }

        if let Some(pair) = self.sessions.write().get_mut(&id.as_u64()) {
            pair.backend = Some(conn.clone());
        }
        Ok(conn)
    }

    /// Proxy shutdown: close every pool, drop every session.
    pub async fn clear(&self) {
        self.backends.close().await;
        let pairs: Vec<SessionPair> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, pair)| pair).collect()
        };
        for pair in pairs {
            pair.session.close();
        }
    }
}
