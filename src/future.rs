//! A single-shot producer/consumer hand-off that suspends a fiber instead
//! of blocking a thread.
//!
//! Conceptually this mirrors the reference implementation's single
//! machine-word state (idle / signalled / waiting-fiber): here that's
//! expressed as a small `enum` behind a `std::sync::Mutex` rather than an
//! atomic CAS over a tagged pointer, since the win from the lock-free
//! encoding is a micro-optimization this crate doesn't need and the mutex
//! keeps the state transitions (and their interaction with
//! [`crate::sync::Waiter`]) easy to read.

use std::sync::Mutex as StdMutex;

use crate::error::Result;
use crate::scheduler::{self, Scheduler};
use crate::sync::Waiter;

type Callback = Box<dyn FnOnce() + Send>;

struct Delivery {
    run: Callback,
    scheduler: Option<Scheduler>,
}

struct Inner<T> {
    signalled: bool,
    value: Option<T>,
    waiter: Option<Waiter>,
    delivery: Option<Delivery>,
}

/// A future that is signalled exactly once, optionally carrying a value of
/// type `T`. `Future<()>` is the void specialization the spec describes
/// separately.
pub struct Future<T> {
    inner: StdMutex<Inner<T>>,
}

impl<T> Future<T> {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                signalled: false,
                value: None,
                waiter: None,
                delivery: None,
            }),
        }
    }

    /// Stores the value that `wait()` will later return. Must be called
    /// before [`Future::signal`]; calling it afterwards is a programming
    /// error since signalling hands the value off immediately.
    pub fn result(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            !inner.signalled,
            "Future::result called after the future was already signalled"
        );
        inner.value = Some(value);
    }

    /// Signals the future. If a delivery callback was registered via
    /// [`Future::on_signal`], it runs (inline, or scheduled on whichever
    /// scheduler was given) instead of waking a parked fiber. Otherwise,
    /// any fiber parked in [`Future::wait`] is rescheduled on the
    /// scheduler it captured when it parked.
    pub fn signal(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(delivery) = inner.delivery.take() {
            drop(inner);
            match delivery.scheduler {
                Some(scheduler) => scheduler.schedule(delivery.run),
                None => (delivery.run)(),
            }
            return;
        }
        inner.signalled = true;
        let waiter = inner.waiter.take();
        drop(inner);
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    /// Registers a callback to run once this future is signalled, instead
    /// of parking a fiber. If already signalled, runs (or schedules) it
    /// immediately.
    pub fn on_signal<F>(&self, scheduler: Option<Scheduler>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.signalled {
            drop(inner);
            match scheduler {
                Some(scheduler) => scheduler.schedule(f),
                None => f(),
            }
            return;
        }
        inner.delivery = Some(Delivery {
            run: Box::new(f),
            scheduler,
        });
    }

    /// Parks the current fiber until the future is signalled, then
    /// returns the stored value.
    ///
    /// # Panics
    ///
    /// Panics if the future was signalled without a value ever having
    /// been set via [`Future::result`].
    pub fn wait(&self) -> Result<T> {
        if !self.start_wait() {
            scheduler::yield_to()?;
        }
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.signalled, "woken from Future::wait before being signalled");
        Ok(inner
            .value
            .take()
            .expect("Future signalled without a stored value"))
    }

    /// Returns the future to idle, ready to be reused. Precondition: no
    /// fiber is currently parked in [`Future::wait`].
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            inner.waiter.is_none(),
            "Future::reset called while a fiber was waiting"
        );
        inner.signalled = false;
        inner.value = None;
        inner.delivery = None;
    }

    pub fn is_signalled(&self) -> bool {
        self.inner.lock().unwrap().signalled
    }

    /// Installs the current fiber as the waiter without yielding; returns
    /// whether the future was already signalled (in which case no waiter
    /// was installed, since there's nothing to wait for).
    ///
    /// Exposed for [`wait_all`]/[`wait_any`], which need to park on many
    /// futures in one go rather than one at a time.
    pub fn start_wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.signalled {
            return true;
        }
        inner.waiter = Some(Waiter::current());
        false
    }

    /// Removes the current fiber as the pending waiter, if it still is
    /// one. Returns whether the future was signalled in the meantime —
    /// which, if true, means `signal()` already queued a wake-up for this
    /// fiber that the caller must account for (see [`wait_any`]).
    pub fn cancel_wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.waiter.take().is_some() {
            false
        } else {
            inner.signalled
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parks until every future in `futures` has signalled.
pub fn wait_all<T>(futures: &[&Future<T>]) -> Result<()> {
    let mut pending = 0;
    for f in futures {
        if !f.start_wait() {
            pending += 1;
        }
    }
    // Each of the `pending` futures wakes us exactly once when it fires,
    // independently of the others, so one `yield_to` per pending future
    // drains them all.
    for _ in 0..pending {
        scheduler::yield_to()?;
    }
    Ok(())
}

/// Parks until at least one future in `futures` has signalled, and returns
/// the index of the earliest one (in iteration order) to do so.
pub fn wait_any<T>(futures: &[&Future<T>]) -> Result<usize> {
    assert!(!futures.is_empty(), "wait_any requires at least one future");
    let mut installed = Vec::with_capacity(futures.len());
    let mut already = None;
    for (i, f) in futures.iter().enumerate() {
        if f.start_wait() {
            already = Some(i);
            break;
        }
        installed.push(i);
    }

    if already.is_none() {
        scheduler::yield_to()?;
    }

    let mut winner = already;
    let mut fired = 0usize;
    for &i in installed.iter().rev() {
        if futures[i].cancel_wait() {
            fired += 1;
            if winner.map_or(true, |w| i < w) {
                winner = Some(i);
            }
        }
    }

    // If we parked, that single `yield_to` already consumed one firing;
    // any further firings queued a wake-up for us that never gets
    // otherwise collected, so drain them here.
    let already_drained = if already.is_none() { 1 } else { 0 };
    for _ in 0..fired.saturating_sub(already_drained) {
        scheduler::yield_to()?;
    }

    Ok(winner.expect("wait_any: no future ever signalled"))
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;

    #[test]
    fn wait_returns_stored_value_after_signal() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let future = Arc::new(Future::new());
        future.result(42);
        future.signal();
        scheduler.dispatch({
            let future = Arc::clone(&future);
            move || {
                assert_eq!(future.wait().unwrap(), 42);
            }
        });
        scheduler.stop();
    }

    #[test]
    fn wait_parks_until_signalled_from_another_fiber() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let future = Arc::new(Future::new());

        scheduler.dispatch({
            let future = Arc::clone(&future);
            move || {
                let signaller = Arc::clone(&future);
                let fiber = Fiber::new("signaller", move || {
                    signaller.result(7);
                    signaller.signal();
                })
                .unwrap();
                crate::scheduler::current().unwrap().schedule_fiber(fiber);
                assert_eq!(future.wait().unwrap(), 7);
            }
        });
        scheduler.stop();
    }

    #[test]
    fn wait_any_returns_earliest_already_signalled() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let a = Future::<()>::new();
        let b = Future::<()>::new();
        a.result(());
        a.signal();
        scheduler.dispatch(move || {
            let index = wait_any(&[&a, &b]).unwrap();
            assert_eq!(index, 0);
        });
        scheduler.stop();
    }

    #[test]
    fn wait_all_waits_for_every_future() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let a = Arc::new(Future::<()>::new());
        let b = Arc::new(Future::<()>::new());

        scheduler.dispatch({
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            move || {
                for f in [Arc::clone(&a), Arc::clone(&b)] {
                    let fiber = Fiber::new("signaller", move || {
                        f.result(());
                        f.signal();
                    })
                    .unwrap();
                    crate::scheduler::current().unwrap().schedule_fiber(fiber);
                }
                wait_all(&[&a, &b]).unwrap();
                assert!(a.is_signalled() && b.is_signalled());
            }
        });
        scheduler.stop();
    }
}
