//! One-shot readiness notification.
//!
//! A [`Poller`] watches raw socket handles and reports, per registration,
//! when the socket becomes readable — without dedicating a thread to block
//! on it. Delivery is one-shot: each arm cycle produces at most one handler
//! invocation, and the owner must explicitly [`Poller::rearm`] before the
//! next event can fire. This is the mechanism that keeps reads on a shared
//! connection strictly sequential.
//!
//! Sockets enter the poller through the [`Pollable`] capability trait rather
//! than by concrete type, so transport wrappers can participate by exposing
//! their underlying handle.

mod error;
mod pollable;
mod poller;

pub use error::NotifyError;
pub use pollable::Pollable;
pub use poller::{EventHandler, Poller, ReadyEvent, Token};
