//! A condition variable paired with a [`FiberMutex`].

use std::sync::{Arc, Mutex as StdMutex};

use crate::error::Result;

use super::{FiberMutex, FiberMutexGuard, WaitQueue};

/// A condition variable bound to a specific [`FiberMutex`] at construction,
/// the way the reference implementation pairs the two.
pub struct FiberCondition<T: ?Sized> {
    mutex: Arc<FiberMutex<T>>,
    waiters: StdMutex<WaitQueue>,
}

impl<T: ?Sized> FiberCondition<T> {
    pub fn new(mutex: Arc<FiberMutex<T>>) -> Self {
        Self {
            mutex,
            waiters: StdMutex::new(WaitQueue::new()),
        }
    }

    /// The mutex this condition is paired with.
    pub fn mutex(&self) -> &Arc<FiberMutex<T>> {
        &self.mutex
    }

    /// Releases `guard` and parks the current fiber until woken by
    /// [`FiberCondition::signal`]/[`FiberCondition::broadcast`], then
    /// re-acquires the mutex before returning.
    ///
    /// `guard` must have been produced by `self.mutex()`; passing a guard
    /// for a different mutex is a programming error and will deadlock.
    pub fn wait(&self, guard: FiberMutexGuard<'_, T>) -> Result<FiberMutexGuard<'_, T>> {
        {
            // Holding `self.waiters` for the whole push-then-release keeps
            // a concurrent `signal`/`broadcast` from running between "we
            // recorded ourselves as waiting" and "we gave up the mutex" --
            // the two locks involved are distinct, so this can't deadlock.
            let mut waiters = self.waiters.lock().unwrap();
            waiters.push();
            drop(guard);
        }
        super::park()?;
        // By the time we're woken, `signal`/`broadcast` (via
        // `FiberMutex::transfer_waiter`) or a subsequent `unlock` has
        // already made us the owner; this just wraps that fact in a guard
        // without re-running the contention path in `FiberMutex::lock`.
        Ok(self.mutex.assume_locked())
    }

    /// Wakes the longest-waiting fiber, handing it straight to the mutex
    /// (as owner if unowned, otherwise as the mutex's own next waiter).
    pub fn signal(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(w) = waiters.pop() {
            drop(waiters);
            self.mutex.transfer_waiter(w);
        }
    }

    /// Wakes every waiting fiber, each handed to the mutex in turn.
    pub fn broadcast(&self) {
        let woken: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            std::iter::from_fn(|| waiters.pop()).collect()
        };
        for w in woken {
            self.mutex.transfer_waiter(w);
        }
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::{self, Scheduler};
    use std::sync::Mutex as StdSyncMutex;

    #[test]
    fn signal_wakes_a_single_waiter() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let mutex = Arc::new(FiberMutex::new(false));
        let cond = Arc::new(FiberCondition::new(Arc::clone(&mutex)));
        let woke = Arc::new(StdSyncMutex::new(false));
        let woke_outer = Arc::clone(&woke);

        scheduler.dispatch(move || {
            let cond2 = Arc::clone(&cond);
            let mutex2 = Arc::clone(&mutex);
            let woke2 = Arc::clone(&woke);
            let fiber = Fiber::new("waiter", move || {
                let mut guard = mutex2.lock().unwrap();
                while !*guard {
                    guard = cond2.wait(guard).unwrap();
                }
                *woke2.lock().unwrap() = true;
            })
            .unwrap();
            scheduler::current().unwrap().schedule_fiber(fiber);
            scheduler::yield_now().unwrap();

            assert!(!*woke.lock().unwrap());
            let mut guard = mutex.lock().unwrap();
            *guard = true;
            drop(guard);
            cond.signal();
        });
        scheduler.stop();
        assert!(*woke_outer.lock().unwrap());
    }
}
