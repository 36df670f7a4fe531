//! Notifier error types.

use thiserror::Error;

/// Errors surfaced by [`crate::Poller`] operations.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// A handler is already installed for this registration.
    #[error("socket is already being watched")]
    AlreadyWatching,

    /// The registration was deregistered (or never existed).
    #[error("registration is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
