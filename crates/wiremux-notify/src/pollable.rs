//! The capability trait for pollable transports.

use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

/// Capability to expose a raw OS handle suitable for readiness polling.
///
/// Any transport wrapper (TLS, instrumentation, rate limiting) that wants
/// its connections multiplexed must implement this and return the handle of
/// the socket it ultimately wraps. The returned handle must stay valid for
/// as long as the registration created from it.
pub trait Pollable {
    fn pollable_fd(&self) -> RawFd;
}

impl Pollable for TcpStream {
    fn pollable_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}
