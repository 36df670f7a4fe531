//! Wiremux transport core.
//!
//! Multiplexes many long-lived websocket connections onto a small pool of
//! worker threads. Idle connections cost no thread: each one is parked in
//! the one-shot readiness poller and only occupies a worker for the duration
//! of a single message decode + callback. The pieces:
//!
//! - [`Pool`] — bounded-concurrency task executor with lazily spawned,
//!   reusable workers.
//! - [`Connection`] — one duplex message channel with sequential, re-armed
//!   reads and idempotent teardown.
//! - [`ConnectionRegistry`] — identifier → connection table, one instance
//!   injected per multiplexer.
//! - [`Multiplexer`] — wires readiness events to pooled reads and dispatches
//!   decoded messages to the application callback.

pub mod conn;
pub mod error;
pub mod mux;
pub mod pool;
pub mod registry;

pub use conn::{Connection, MessageCallback};
pub use error::MuxError;
pub use mux::Multiplexer;
pub use pool::Pool;
pub use registry::ConnectionRegistry;
