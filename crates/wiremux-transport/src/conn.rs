//! One duplex message channel over a TCP socket.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};
use tungstenite::Message;
use tungstenite::protocol::{Role as WsRole, WebSocket};

use wiremux_notify::{Poller, Token};
use wiremux_protocol::{ControlPolicy, Opcode, Role};

use crate::error::MuxError;

/// Invoked for every message delivered on any connection of a multiplexer.
pub type MessageCallback = Arc<dyn Fn(&Connection, Opcode, Bytes) + Send + Sync>;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A connection handle. Clones share the same underlying channel.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

pub(crate) struct ConnInner {
    role: Role,
    peer: Option<SocketAddr>,
    /// Control handle: registered with the poller, shut down on close.
    /// Shares its file description with the reader and writer clones.
    stream: TcpStream,
    /// Codec read half. Never contended: the one-shot readiness discipline
    /// admits a single read at a time.
    reader: Mutex<WebSocket<TcpStream>>,
    /// Codec write half. Serializes concurrent `send` callers.
    writer: Mutex<WebSocket<TcpStream>>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
    poller: Arc<Poller>,
    pub(crate) token: Token,
}

fn ws_role(role: Role) -> WsRole {
    match role {
        Role::Client => WsRole::Client,
        Role::Server => WsRole::Server,
    }
}

impl Connection {
    /// Wrap a freshly handshaken codec in a connection.
    ///
    /// The handshake's `WebSocket` becomes the read half so any bytes it has
    /// already buffered are preserved; the write half runs over a duplicated
    /// handle of the same socket.
    pub(crate) fn new(
        reader: WebSocket<TcpStream>,
        role: Role,
        poller: Arc<Poller>,
    ) -> Result<Connection, MuxError> {
        let stream = reader.get_ref().try_clone()?;
        let writer_stream = reader.get_ref().try_clone()?;
        let peer = stream.peer_addr().ok();
        let token = poller.register(&stream);
        let writer = WebSocket::from_raw_socket(writer_stream, ws_role(role), None);

        Ok(Connection {
            inner: Arc::new(ConnInner {
                role,
                peer,
                stream,
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                closed: AtomicBool::new(false),
                on_close: Mutex::new(None),
                poller,
                token,
            }),
        })
    }

    /// Encode and write one message. Callable from any thread; concurrent
    /// senders serialize on the write half.
    pub fn send(&self, opcode: Opcode, payload: impl Into<Bytes>) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }
        let message = encode(opcode, payload.into())?;
        let mut writer = self.inner.writer.lock();
        writer.send(message).map_err(|err| match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                MuxError::ConnectionClosed
            }
            err => MuxError::Protocol(err),
        })
    }

    /// Idempotent teardown: deregister from the poller, shut the socket
    /// down, then fire the close callback. Any in-flight decode fails fast
    /// once the socket is shut down.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = ?self.inner.peer, "closing connection");
        self.inner.poller.deregister(self.inner.token);
        if let Err(err) = self.inner.stream.shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                debug!(%err, "socket shutdown");
            }
        }
        // Take the callback under the lock, invoke it outside: the callback
        // is free to touch this connection again.
        let callback = self.inner.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Replace the close callback. Has no effect on an already-closed
    /// connection.
    pub fn set_on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *self.inner.on_close.lock() = Some(Box::new(callback));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_client(&self) -> bool {
        self.inner.role.is_client()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Decode one application-visible message and hand it to the callback.
    ///
    /// Control frames are consumed inline per the policy; a close frame or
    /// any decode failure closes the connection without dispatching. The
    /// caller owns the cost of the decode and the callback invocation.
    pub(crate) fn read_once(&self, callback: &MessageCallback, policy: ControlPolicy) {
        loop {
            let message = {
                let mut reader = self.inner.reader.lock();
                reader.read()
            };
            match message {
                Ok(message @ Message::Text(_)) => {
                    callback(self, Opcode::Text, message.into_data());
                    return;
                }
                Ok(message @ Message::Binary(_)) => {
                    callback(self, Opcode::Binary, message.into_data());
                    return;
                }
                Ok(message @ Message::Ping(_)) => {
                    // The codec already queued the pong reply.
                    if policy == ControlPolicy::Surface {
                        callback(self, Opcode::Ping, message.into_data());
                        return;
                    }
                }
                Ok(message @ Message::Pong(_)) => {
                    if policy == ControlPolicy::Surface {
                        callback(self, Opcode::Pong, message.into_data());
                        return;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(peer = ?self.inner.peer, "peer sent close frame");
                    self.close();
                    return;
                }
                Ok(Message::Frame(_)) => {
                    warn!(peer = ?self.inner.peer, "unexpected raw frame; closing connection");
                    self.close();
                    return;
                }
                Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ) => {
                    self.close();
                    return;
                }
                Err(err) => {
                    warn!(peer = ?self.inner.peer, %err, "decode failed; closing connection");
                    self.close();
                    return;
                }
            }
        }
    }
}

fn encode(opcode: Opcode, payload: Bytes) -> Result<Message, MuxError> {
    Ok(match opcode {
        Opcode::Text => {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| MuxError::InvalidText)?;
            Message::text(text)
        }
        Opcode::Binary => Message::binary(payload),
        Opcode::Ping => Message::Ping(payload),
        Opcode::Pong => Message::Pong(payload),
    })
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        // Last handle gone without an explicit close: release the OS
        // resources, but there is nobody left to observe the callback.
        if !self.closed.load(Ordering::SeqCst) {
            self.poller.deregister(self.token);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}
