//! A fiber-aware event flag, auto- or manual-reset.

use std::sync::Mutex as StdMutex;

use crate::error::Result;

use super::WaitQueue;

struct State {
    signalled: bool,
    waiters: WaitQueue,
}

/// A boolean event flag that parks waiters until set.
///
/// In auto-reset mode (the default), `set()` wakes exactly one waiter and
/// the flag never latches true for anyone else; in manual-reset mode it
/// latches until explicitly cleared, waking every current and future
/// waiter in the meantime.
pub struct FiberEvent {
    auto_reset: bool,
    state: StdMutex<State>,
}

impl FiberEvent {
    /// Creates an auto-reset event, as the reference implementation
    /// defaults to.
    pub fn new() -> Self {
        Self::with_auto_reset(true)
    }

    pub fn with_auto_reset(auto_reset: bool) -> Self {
        Self {
            auto_reset,
            state: StdMutex::new(State {
                signalled: false,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Parks the current fiber until the event is signalled.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.signalled {
            if self.auto_reset {
                state.signalled = false;
            }
            return Ok(());
        }
        state.waiters.push();
        drop(state);
        super::park()
    }

    /// Signals the event: wakes one waiter (auto-reset) or every current
    /// and future waiter until [`FiberEvent::reset`] (manual-reset).
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        if self.auto_reset {
            if state.waiters.wake_one() {
                return;
            }
            state.signalled = true;
        } else {
            state.signalled = true;
            state.waiters.wake_all();
        }
    }

    /// Clears a manual-reset event. A no-op in auto-reset mode, since
    /// there `signalled` never latches past the first waiter.
    pub fn reset(&self) {
        self.state.lock().unwrap().signalled = false;
    }

    pub fn is_signalled(&self) -> bool {
        self.state.lock().unwrap().signalled
    }
}

impl Default for FiberEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::{self, Scheduler};
    use std::sync::{Arc, Mutex as StdSyncMutex};

    #[test]
    fn wait_returns_immediately_once_signalled() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let ev = FiberEvent::new();
        ev.set();
        scheduler.dispatch(move || {
            ev.wait().unwrap();
        });
        scheduler.stop();
    }

    #[test]
    fn manual_reset_wakes_everyone() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let ev = Arc::new(FiberEvent::with_auto_reset(false));
        let count = Arc::new(StdSyncMutex::new(0));
        let count_outer = Arc::clone(&count);

        scheduler.dispatch(move || {
            for _ in 0..3 {
                let ev = Arc::clone(&ev);
                let count = Arc::clone(&count);
                let fiber = Fiber::new("waiter", move || {
                    ev.wait().unwrap();
                    *count.lock().unwrap() += 1;
                })
                .unwrap();
                scheduler::current().unwrap().schedule_fiber(fiber);
            }
            scheduler::yield_now().unwrap();
            ev.set();
        });
        scheduler.stop();
        assert_eq!(*count_outer.lock().unwrap(), 3);
    }
}
