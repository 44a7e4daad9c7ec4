//! The `idle()`/`tickle()` hook a worker falls back on when its queue is
//! empty.
//!
//! `idle()` runs on a dedicated per-worker fiber so that a derived
//! scheduler (e.g. one that multiplexes an epoll set) can cooperatively
//! yield while it waits for external events, the same way a plain task
//! fiber would. The stock implementation has nothing external to wait on,
//! so it just parks the OS thread on a condition variable shared with
//! [`super::Scheduler::tickle`] — which is, in effect, a `Notify`-style
//! binary semaphore with a bounded wait so a missed wakeup (a tickle that
//! lands between the emptiness check and the wait call) is never fatal.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::Scheduler;

/// Bound on how long a worker sleeps before re-checking `stopping()` and
/// any pending resize request, even without being tickled. Keeps a missed
/// wakeup from hanging a worker forever.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Hook invoked by a worker when it has no task to run.
///
/// Implement this to teach a scheduler about an external event source
/// (timers, an I/O multiplexer, …); the default implementation simply
/// sleeps until [`Scheduler::tickle`] is called or the scheduler starts
/// stopping.
pub trait Idle: Send + Sync {
    /// Runs one "tick" of idleness. Should return promptly once there is
    /// reason to believe new work is available, or once
    /// `scheduler.stopping()` holds; it does not need to re-check those
    /// itself, since the caller loops. The per-worker idle fiber wraps
    /// each call to `run` with a `scheduler::yield_to()` back to the
    /// worker's dispatch loop, so returning from one tick actually hands
    /// control back to the worker (which re-scans its queue) rather than
    /// looping straight into another tick.
    fn run(&self, scheduler: &Scheduler);

    /// Wakes whoever is parked in [`Idle::run`]. Called by
    /// [`Scheduler::tickle`](super::Scheduler::tickle); the default
    /// implementation is a no-op, since a derived `Idle` built on, say,
    /// an epoll fd typically wakes itself by writing to an eventfd
    /// instead of going through this hook.
    fn notify(&self) {}
}

/// The semaphore-like default [`Idle`] implementation described by the
/// spec: a worker with nothing to do blocks until tickled.
#[derive(Default)]
pub struct DefaultIdle {
    signal: Mutex<()>,
    cond: Condvar,
}

impl DefaultIdle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes anyone parked in [`Idle::run`].
    pub fn notify(&self) {
        self.cond.notify_all();
    }
}

impl Idle for DefaultIdle {
    fn run(&self, scheduler: &Scheduler) {
        let guard = self.signal.lock().unwrap();
        if scheduler.stopping() || !scheduler.queue_is_empty() {
            return;
        }
        let _ = self.cond.wait_timeout(guard, IDLE_POLL_INTERVAL).unwrap();
    }

    fn notify(&self) {
        DefaultIdle::notify(self)
    }
}
