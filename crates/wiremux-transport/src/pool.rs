//! Bounded pool of reusable worker threads.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task executor with a hard cap on concurrency.
///
/// Workers are spawned lazily: scheduling a task races a direct handoff to
/// an already-idle worker against acquiring a slot in the capacity gate, and
/// only spawns a new thread when the gate wins. A spawned worker keeps its
/// gate slot for the lifetime of the pool, so the worker count grows to the
/// cap and never shrinks; idle workers park on the handoff channel.
///
/// `schedule` blocks only while every worker is busy and the gate is full,
/// i.e. exactly when the concurrency bound would otherwise be exceeded.
pub struct Pool {
    work_tx: Sender<Task>,
    work_rx: Receiver<Task>,
    gate_tx: Sender<()>,
    gate_rx: Receiver<()>,
    capacity: usize,
}

impl Pool {
    /// Create a pool running at most `capacity` tasks concurrently.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Pool {
        assert!(capacity > 0, "pool capacity must be at least 1");
        let (work_tx, work_rx) = bounded(0);
        let (gate_tx, gate_rx) = bounded(capacity);
        Pool {
            work_tx,
            work_rx,
            gate_tx,
            gate_rx,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Schedule a task for execution, exactly once, on some worker.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        let task: Task = Box::new(task);
        select! {
            // An idle worker is waiting on the handoff channel.
            send(self.work_tx, task) -> _res => {}
            // A gate slot is free: lease it and spawn a worker for it.
            send(self.gate_tx, ()) -> _res => {
                self.spawn_worker(task);
            }
        }
    }

    fn spawn_worker(&self, seed: Task) {
        let work_rx = self.work_rx.clone();
        thread::Builder::new()
            .name("wiremux-worker".into())
            .spawn(move || worker_loop(seed, work_rx))
            .expect("failed to spawn pool worker thread");
    }
}

/// Run the seed task, then serve handoffs until the pool is dropped.
fn worker_loop(seed: Task, work_rx: Receiver<Task>) {
    run_task(seed);
    while let Ok(task) = work_rx.recv() {
        run_task(task);
    }
}

/// Panics are isolated per task: a failing task must not take its worker
/// (and with it a concurrency slot) down with it.
fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<opaque panic payload>");
        error!(message, "pool task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(done: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "tasks did not complete in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_every_task_exactly_once_within_the_bound() {
        let pool = Pool::new(16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..26 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            pool.schedule(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_for(&done, 26);
        assert_eq!(done.load(Ordering::SeqCst), 26);
        assert!(peak.load(Ordering::SeqCst) <= 16);
    }

    #[test]
    fn reuses_idle_workers() {
        let pool = Pool::new(4);
        let done = Arc::new(AtomicUsize::new(0));

        // Two waves; the second wave must be served by the workers the
        // first wave spawned (the gate has no free slots left to observe
        // beyond capacity anyway, this checks nothing deadlocks).
        for _ in 0..2 {
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.schedule(move || {
                    thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        }

        wait_for(&done, 8);
    }

    #[test]
    fn panicking_task_does_not_shrink_the_pool() {
        let pool = Pool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        pool.schedule(|| panic!("task failure"));

        for _ in 0..6 {
            let done = Arc::clone(&done);
            pool.schedule(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_for(&done, 6);
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_is_rejected() {
        let _ = Pool::new(0);
    }
}
