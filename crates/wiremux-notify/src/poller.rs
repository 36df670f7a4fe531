//! The mio-backed one-shot poller.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::NotifyError;
use crate::pollable::Pollable;

/// Reserved for the shutdown waker; real registrations start above it.
const WAKE: mio::Token = mio::Token(0);

/// Identifies one socket registration for its whole lifetime.
///
/// Tokens are never reused, so a stale token held across a deregistration
/// cannot alias a newer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

/// One delivered readiness event.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// The peer closed its write side, or the socket errored. The owner
    /// should tear the connection down instead of reading.
    pub is_hangup: bool,
}

/// Invoked on the dispatch thread for each delivered event.
pub type EventHandler = Arc<dyn Fn(ReadyEvent) + Send + Sync>;

struct Watch {
    fd: RawFd,
    handler: Option<EventHandler>,
    armed: bool,
}

struct Shared {
    registry: mio::Registry,
    watches: Mutex<HashMap<usize, Watch>>,
    waker: Waker,
    shutdown: AtomicBool,
}

/// One-shot readiness poller with a single dispatch thread.
///
/// Lifecycle of a registration:
/// 1. [`register`](Poller::register) allocates a token for a socket handle.
///    No events can fire yet.
/// 2. [`watch`](Poller::watch) installs the event handler and arms the first
///    one-shot cycle.
/// 3. Each delivered event disarms the registration; [`rearm`](Poller::rearm)
///    enables the next delivery. Readiness that is already pending at re-arm
///    time is re-reported.
/// 4. [`deregister`](Poller::deregister) removes interest and the handler.
///
/// Events arriving while disarmed are dropped; that is what guarantees at
/// most one in-flight handler invocation per registration.
pub struct Poller {
    shared: Arc<Shared>,
    next_token: AtomicUsize,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Poller {
    /// Create the poller and start its dispatch thread.
    pub fn new() -> io::Result<Poller> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let shared = Arc::new(Shared {
            registry,
            watches: Mutex::new(HashMap::new()),
            waker,
            shutdown: AtomicBool::new(false),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("wiremux-poll".into())
                .spawn(move || dispatch(poll, shared))?
        };

        Ok(Poller {
            shared,
            next_token: AtomicUsize::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Allocate a registration for a socket handle.
    ///
    /// The handle is not added to the OS poller until [`watch`](Poller::watch)
    /// installs a handler, so an event can never fire without one.
    pub fn register(&self, source: &impl Pollable) -> Token {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared.watches.lock().insert(
            token,
            Watch {
                fd: source.pollable_fd(),
                handler: None,
                armed: false,
            },
        );
        Token(token)
    }

    /// Install the event handler and arm the first one-shot cycle.
    pub fn watch(&self, token: Token, handler: EventHandler) -> Result<(), NotifyError> {
        let mut watches = self.shared.watches.lock();
        let watch = watches.get_mut(&token.0).ok_or(NotifyError::Closed)?;
        if watch.handler.is_some() {
            return Err(NotifyError::AlreadyWatching);
        }
        self.shared
            .registry
            .register(&mut SourceFd(&watch.fd), mio::Token(token.0), Interest::READABLE)?;
        watch.handler = Some(handler);
        watch.armed = true;
        Ok(())
    }

    /// Arm one further event delivery.
    ///
    /// Must only be called after the previous event has been fully handled;
    /// the re-registration re-reports readiness that is already pending.
    pub fn rearm(&self, token: Token) -> Result<(), NotifyError> {
        let mut watches = self.shared.watches.lock();
        let watch = watches.get_mut(&token.0).ok_or(NotifyError::Closed)?;
        if watch.handler.is_none() {
            return Err(NotifyError::Closed);
        }
        self.shared
            .registry
            .reregister(&mut SourceFd(&watch.fd), mio::Token(token.0), Interest::READABLE)?;
        watch.armed = true;
        Ok(())
    }

    /// Remove interest and the handler. Idempotent; events already queued
    /// for this token are dropped on delivery.
    pub fn deregister(&self, token: Token) {
        let watch = self.shared.watches.lock().remove(&token.0);
        if let Some(watch) = watch {
            if watch.handler.is_some() {
                if let Err(err) = self.shared.registry.deregister(&mut SourceFd(&watch.fd)) {
                    debug!(%err, "deregister failed (socket likely gone)");
                }
            }
        }
    }

    /// Stop the dispatch thread. Safe to call more than once. Must not be
    /// called from inside an event handler.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn dispatch(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(128);
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(%err, "poll failed; stopping dispatch");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKE {
                if shared.shutdown.load(Ordering::Acquire) {
                    debug!("dispatch thread stopping");
                    return;
                }
                continue;
            }

            // Consume the arm cycle under the lock, run the handler outside
            // it so the handler can rearm or deregister.
            let handler = {
                let mut watches = shared.watches.lock();
                match watches.get_mut(&event.token().0) {
                    Some(watch) if watch.armed => {
                        watch.armed = false;
                        watch.handler.clone()
                    }
                    // Disarmed or deregistered: stale edge, drop it.
                    _ => None,
                }
            };

            if let Some(handler) = handler {
                let ready = ReadyEvent {
                    is_hangup: event.is_read_closed() || event.is_error(),
                };
                if panic::catch_unwind(AssertUnwindSafe(|| handler(ready))).is_err() {
                    warn!("event handler panicked");
                }
            }
        }
    }
}
