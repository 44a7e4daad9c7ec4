//! A mutex that parks contending fibers instead of blocking OS threads.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex as StdMutex;

use crate::error::Result;
use crate::fiber::{self, Fiber};

use super::WaitQueue;

struct State {
    owner: Option<Fiber>,
    waiters: WaitQueue,
}

/// A fiber-aware mutual-exclusion lock.
///
/// Contending for a locked [`FiberMutex`] parks the calling fiber rather
/// than blocking its OS thread, the same way [`std::sync::Mutex`] blocks a
/// thread — just one layer up. Waiters are served strictly in the order
/// they arrived.
pub struct FiberMutex<T: ?Sized> {
    state: StdMutex<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: StdMutex::new(State {
                owner: None,
                waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    /// Acquires the lock, parking the current fiber as many times as
    /// needed until it becomes the owner.
    ///
    /// # Panics
    ///
    /// Panics if the current fiber already owns this mutex — re-entrant
    /// locking is a programming error here; use [`super::RecursiveFiberMutex`]
    /// if that's what you need.
    pub fn lock(&self) -> Result<FiberMutexGuard<'_, T>> {
        let me = fiber::current().expect("FiberMutex::lock called outside a running fiber");
        let mut state = self.state.lock().unwrap();
        if state.owner.is_none() {
            state.owner = Some(me);
            return Ok(FiberMutexGuard { mutex: self });
        }
        assert!(
            state.owner.as_ref() != Some(&me),
            "fiber attempted to lock a FiberMutex it already owns"
        );
        state.waiters.push();
        drop(state);
        super::park()?;
        // `unlock` only ever wakes the fiber it just handed ownership to,
        // so there's no spurious wakeup to re-check here.
        Ok(FiberMutexGuard { mutex: self })
    }

    /// Acquires the lock without ever yielding; returns `None` if it's
    /// currently held.
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        let me = fiber::current().expect("FiberMutex::try_lock called outside a running fiber");
        let mut state = self.state.lock().unwrap();
        if state.owner.is_some() {
            return None;
        }
        state.owner = Some(me);
        Some(FiberMutexGuard { mutex: self })
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap();
        match state.waiters.pop() {
            Some(next) => {
                state.owner = Some(next.fiber.clone());
                drop(state);
                next.wake();
            }
            None => {
                state.owner = None;
            }
        }
    }

    /// Wraps a guard without touching `owner`, for a caller that already
    /// knows it was just granted ownership via [`FiberMutex::transfer_waiter`]
    /// (used by [`super::FiberCondition::wait`] to reacquire after a
    /// condition hand-off, which bypasses the normal contention path in
    /// [`FiberMutex::lock`]).
    pub(crate) fn assume_locked(&self) -> FiberMutexGuard<'_, T> {
        FiberMutexGuard { mutex: self }
    }

    /// Hands `waiter` straight to this mutex: if it's unowned, `waiter`
    /// becomes the owner and is woken immediately; otherwise it's appended
    /// to the normal FIFO waiter queue to be woken by a later `unlock`.
    ///
    /// Used by [`super::FiberCondition`] to move a waiter from the
    /// condition's own queue to the mutex's without an intermediate wakeup.
    pub(crate) fn transfer_waiter(&self, waiter: super::Waiter) {
        let mut state = self.state.lock().unwrap();
        if state.owner.is_none() {
            state.owner = Some(waiter.fiber.clone());
            drop(state);
            waiter.wake();
        } else {
            state.waiters.push_waiter(waiter);
        }
    }

    /// Unlocks only if at least one fiber is waiting; otherwise leaves the
    /// mutex held by `guard`'s caller. Consumes the guard either way,
    /// since calling this implies "I'm done, but don't bother if I'm the
    /// only one who'll ever want it".
    ///
    /// Returns whether the unlock actually happened.
    pub fn unlock_if_not_unique(&self, guard: FiberMutexGuard<'_, T>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.waiters.is_empty() {
            std::mem::forget(guard);
            return false;
        }
        drop(state);
        drop(guard);
        true
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + Default> Default for FiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FiberMutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                d.field("data", &"<locked>");
            }
        }
        d.finish_non_exhaustive()
    }
}

/// RAII guard returned by [`FiberMutex::lock`]/[`FiberMutex::try_lock`];
/// unlocks on drop.
pub struct FiberMutexGuard<'a, T: ?Sized> {
    mutex: &'a FiberMutex<T>,
}

impl<T: ?Sized> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized> Deref for FiberMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use crate::scheduler::{self, Scheduler};
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn uncontended_lock_is_immediate() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let m = FiberMutex::new(0);
            *m.lock().unwrap() = 5;
            assert_eq!(*m.lock().unwrap(), 5);
        });
        scheduler.stop();
    }

    #[test]
    fn contended_lock_hands_off_fifo() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        let m = Arc::new(FiberMutex::new(()));
        let order = Arc::new(StdMutex::new(Vec::new()));
        let order_outer = Arc::clone(&order);

        scheduler.dispatch(move || {
            let guard = m.lock().unwrap();
            for i in 0..3u32 {
                let m = Arc::clone(&m);
                let order = Arc::clone(&order);
                let fiber = Fiber::new(format!("waiter-{i}"), move || {
                    let _g = m.lock().unwrap();
                    order.lock().unwrap().push(i);
                })
                .unwrap();
                scheduler::current().unwrap().schedule_fiber(fiber);
            }
            // Let the three waiters queue up behind us before we release.
            scheduler::yield_now().unwrap();
            drop(guard);
        });
        scheduler.stop();
        assert_eq!(*order_outer.lock().unwrap(), vec![0, 1, 2]);
    }
}
