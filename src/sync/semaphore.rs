//! A fiber-aware counting semaphore.

use std::sync::Mutex as StdMutex;

use crate::error::Result;

use super::WaitQueue;

struct State {
    permits: usize,
    waiters: WaitQueue,
}

/// A counting semaphore whose `wait()` parks the calling fiber instead of
/// blocking an OS thread.
pub struct FiberSemaphore {
    state: StdMutex<State>,
}

impl FiberSemaphore {
    pub fn new(initial_permits: usize) -> Self {
        Self {
            state: StdMutex::new(State {
                permits: initial_permits,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Takes a permit, parking the current fiber if none is available.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            return Ok(());
        }
        state.waiters.push();
        drop(state);
        super::park()
    }

    /// Wakes the longest-waiting fiber if any is parked; otherwise adds a
    /// permit. Note that waking a waiter does not touch `permits` — the
    /// permit effectively passes straight from notifier to waiter.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        if state.waiters.wake_one() {
            return;
        }
        state.permits += 1;
    }

    /// Number of permits immediately available, for diagnostics.
    pub fn available_permits(&self) -> usize {
        self.state.lock().unwrap().permits
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::{self, Scheduler};
    use std::sync::{Arc, Mutex as StdSyncMutex};

    #[test]
    fn wait_consumes_available_permit() {
        let sem = FiberSemaphore::new(1);
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(move || {
            sem.wait().unwrap();
            assert_eq!(sem.available_permits(), 0);
        });
        scheduler.stop();
    }

    #[test]
    fn notify_wakes_a_waiter_before_incrementing() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let sem = Arc::new(FiberSemaphore::new(0));
        let woke = Arc::new(StdSyncMutex::new(false));
        let woke_outer = Arc::clone(&woke);

        scheduler.dispatch(move || {
            let sem2 = Arc::clone(&sem);
            let woke2 = Arc::clone(&woke);
            let fiber = Fiber::new("waiter", move || {
                sem2.wait().unwrap();
                *woke2.lock().unwrap() = true;
            })
            .unwrap();
            scheduler::current().unwrap().schedule_fiber(fiber);
            scheduler::yield_now().unwrap();
            assert!(!*woke.lock().unwrap());
            sem.notify();
            assert_eq!(sem.available_permits(), 0);
        });
        scheduler.stop();
        assert!(*woke_outer.lock().unwrap());
    }
}
