//! Identifier → connection table.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::conn::Connection;

/// Concurrent map from external connection identifiers to connections.
///
/// One instance is injected per multiplexer — never a process-wide global.
/// Entries have no TTL: they live until deleted or overwritten, and the
/// multiplexer replaces a closed entry when the same identifier reconnects.
/// Registry membership is the single source of truth for whether a
/// server-side connection still exists.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Insert or overwrite the connection stored under `id`.
    pub fn set(&self, id: impl Into<String>, conn: Connection) {
        self.connections.lock().insert(id.into(), conn);
    }

    /// Look up `id`. Unknown identifiers are an absence, not an error.
    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.lock().get(id).cloned()
    }

    /// Remove the entry under `id`, if any.
    pub fn delete(&self, id: &str) {
        self.connections.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    use tungstenite::protocol::{Role as WsRole, WebSocket};
    use wiremux_notify::Poller;
    use wiremux_protocol::Role;

    fn test_conn(poller: &Arc<Poller>) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let ws = WebSocket::from_raw_socket(server, WsRole::Server, None);
        Connection::new(ws, Role::Server, Arc::clone(poller)).unwrap()
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let poller = Arc::new(Poller::new().unwrap());
        let registry = ConnectionRegistry::new();

        assert!(registry.get("abc").is_none());
        assert!(registry.is_empty());

        let conn = test_conn(&poller);
        registry.set("abc", conn.clone());
        let fetched = registry.get("abc").expect("stored connection");
        assert!(Arc::ptr_eq(&fetched.inner, &conn.inner));
        assert_eq!(registry.len(), 1);

        registry.delete("abc");
        assert!(registry.get("abc").is_none());

        // Deleting an absent id is a no-op.
        registry.delete("abc");
        poller.shutdown();
    }

    #[test]
    fn overwrite_replaces_entry() {
        let poller = Arc::new(Poller::new().unwrap());
        let registry = ConnectionRegistry::new();

        let first = test_conn(&poller);
        let second = test_conn(&poller);
        registry.set("abc", first.clone());
        registry.set("abc", second.clone());

        let fetched = registry.get("abc").unwrap();
        assert!(Arc::ptr_eq(&fetched.inner, &second.inner));
        assert_eq!(registry.len(), 1);
        poller.shutdown();
    }

    #[test]
    fn concurrent_access_on_distinct_ids() {
        let poller = Arc::new(Poller::new().unwrap());
        let registry = Arc::new(ConnectionRegistry::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let conn = test_conn(&poller);
                thread::spawn(move || {
                    let id = format!("conn-{i}");
                    for _ in 0..200 {
                        registry.set(id.clone(), conn.clone());
                        assert!(registry.get(&id).is_some());
                        registry.delete(&id);
                        assert!(registry.get(&id).is_none());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
        poller.shutdown();
    }
}
