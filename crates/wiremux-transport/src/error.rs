//! Transport error taxonomy.

use thiserror::Error;
use wiremux_notify::NotifyError;

/// Errors surfaced by multiplexer and connection operations.
///
/// Read-side failures never appear here: a failed decode closes the
/// connection, and the close callback is the only signal the application
/// gets. Only `send`, `dial`, and `accept` return errors to the caller.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("text payload is not valid UTF-8")]
    InvalidText,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error(transparent)]
    Notify(#[from] NotifyError),
}
