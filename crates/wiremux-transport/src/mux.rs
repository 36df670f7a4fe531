//! The multiplexer: readiness events in, pooled reads out.

use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use tungstenite::handshake::server::{Request, Response};
use tungstenite::http::Uri;

use wiremux_notify::{NotifyError, Poller, ReadyEvent};
use wiremux_protocol::{ControlPolicy, Role};

use crate::conn::{Connection, MessageCallback};
use crate::error::MuxError;
use crate::pool::Pool;
use crate::registry::ConnectionRegistry;

/// Bridges inbound readiness to read scheduling.
///
/// Each instance owns its poller, callback, registry, and optional worker
/// pool; instances are fully independent. Without a pool, reads execute on
/// the poller's dispatch thread, bounding effective concurrency to one
/// across all connections — acceptable for simple deployments, a pool is
/// the intended configuration for anything busy.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

struct MuxShared {
    callback: MessageCallback,
    poller: Arc<Poller>,
    pool: Mutex<Option<Arc<Pool>>>,
    registry: Arc<ConnectionRegistry>,
    policy: ControlPolicy,
}

impl Multiplexer {
    /// Create a multiplexer dispatching messages to `callback`, with the
    /// default control-frame policy.
    pub fn new(
        callback: MessageCallback,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Multiplexer, MuxError> {
        Multiplexer::with_policy(callback, registry, ControlPolicy::default())
    }

    pub fn with_policy(
        callback: MessageCallback,
        registry: Arc<ConnectionRegistry>,
        policy: ControlPolicy,
    ) -> Result<Multiplexer, MuxError> {
        let poller = Arc::new(Poller::new()?);
        Ok(Multiplexer {
            shared: Arc::new(MuxShared {
                callback,
                poller,
                pool: Mutex::new(None),
                registry,
                policy,
            }),
        })
    }

    /// Hand message reads to a worker pool instead of running them on the
    /// poller's dispatch thread.
    pub fn set_pool(&self, pool: Arc<Pool>) {
        *self.shared.pool.lock() = Some(pool);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    /// Upgrade an inbound TCP connection and start reading from it.
    ///
    /// The connection identifier is taken from the request path
    /// (`/ws/<id>`); connections arriving without one get a fresh UUID. A
    /// reconnect under the identifier of a closed entry replaces that entry;
    /// an identifier whose entry is still open keeps the existing
    /// connection and the new socket is dropped.
    pub fn accept(&self, stream: TcpStream) -> Result<Connection, MuxError> {
        let mut path = String::new();
        let ws = tungstenite::accept_hdr(stream, |request: &Request, response: Response| {
            path = request.uri().path().to_string();
            Ok(response)
        })
        .map_err(|err| MuxError::Handshake(err.to_string()))?;

        let conn_id = conn_id_from_path(&path);
        let conn = match self.shared.registry.get(&conn_id) {
            Some(existing) if !existing.is_closed() => {
                debug!(%conn_id, "connection already open; reusing it");
                existing
            }
            _ => {
                let conn =
                    Connection::new(ws, Role::Server, Arc::clone(&self.shared.poller))?;
                self.shared.registry.set(conn_id.clone(), conn.clone());
                debug!(%conn_id, peer = ?conn.peer_addr(), "connection registered");
                conn
            }
        };

        self.start_read(&conn)?;
        Ok(conn)
    }

    /// Dial a `ws://` URL and start reading from the resulting connection.
    ///
    /// Dialed connections are not stored in the registry; the caller owns
    /// the returned handle.
    pub fn dial(&self, url: &str) -> Result<Connection, MuxError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| MuxError::BadAddress(url.to_string()))?;
        if uri.scheme_str() != Some("ws") {
            return Err(MuxError::BadAddress(url.to_string()));
        }
        let host = uri
            .host()
            .ok_or_else(|| MuxError::BadAddress(url.to_string()))?;
        let port = uri.port_u16().unwrap_or(80);

        let stream = TcpStream::connect((host, port))?;
        let (ws, _response) =
            tungstenite::client(url, stream).map_err(|err| MuxError::Handshake(err.to_string()))?;

        let conn = Connection::new(ws, Role::Client, Arc::clone(&self.shared.poller))?;
        self.start_read(&conn)?;
        Ok(conn)
    }

    /// Stop the poller's dispatch thread. Connections survive but stop
    /// receiving; intended for orderly process teardown.
    pub fn shutdown(&self) {
        self.shared.poller.shutdown();
    }

    /// Arm one-shot readiness for `conn`, wiring events into the read path.
    ///
    /// The handler holds only weak references: the registry (or the dialing
    /// caller) keeps the connection alive, and a dropped multiplexer simply
    /// stops dispatch.
    fn start_read(&self, conn: &Connection) -> Result<(), MuxError> {
        let shared = Arc::downgrade(&self.shared);
        let inner = Arc::downgrade(&conn.inner);
        let result = self.shared.poller.watch(
            conn.inner.token,
            Arc::new(move |event| {
                let Some(shared) = shared.upgrade() else { return };
                let Some(inner) = inner.upgrade() else { return };
                MuxShared::handle_ready(&shared, Connection { inner }, event);
            }),
        );
        match result {
            Ok(()) => Ok(()),
            // Benign: a previous accept already armed this connection, or it
            // closed between construction and arming.
            Err(NotifyError::AlreadyWatching) | Err(NotifyError::Closed) => Ok(()),
            Err(err) => {
                warn!(peer = ?conn.peer_addr(), %err, "readiness registration failed");
                conn.close();
                Err(err.into())
            }
        }
    }
}

impl MuxShared {
    fn handle_ready(shared: &Arc<MuxShared>, conn: Connection, event: ReadyEvent) {
        if event.is_hangup {
            debug!(peer = ?conn.peer_addr(), "peer hung up");
            conn.close();
            return;
        }

        let task_shared = Arc::clone(shared);
        let task = move || {
            conn.read_once(&task_shared.callback, task_shared.policy);
            if conn.is_closed() {
                return;
            }
            if let Err(err) = task_shared.poller.rearm(conn.inner.token) {
                if !matches!(err, NotifyError::Closed) {
                    warn!(peer = ?conn.peer_addr(), %err, "failed to re-arm read");
                }
                conn.close();
            }
        };

        let pool = shared.pool.lock().clone();
        match pool {
            Some(pool) => pool.schedule(task),
            None => task(),
        }
    }
}

fn conn_id_from_path(path: &str) -> String {
    let id = path.trim_start_matches('/').trim_start_matches("ws/");
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_strips_the_ws_prefix() {
        assert_eq!(conn_id_from_path("/ws/abc"), "abc");
        assert_eq!(conn_id_from_path("/abc"), "abc");
        assert_eq!(conn_id_from_path("/ws/a/b"), "a/b");
    }

    #[test]
    fn empty_path_gets_a_generated_id() {
        let id = conn_id_from_path("/");
        assert!(!id.is_empty());
        assert_ne!(id, conn_id_from_path("/"));
    }
}
