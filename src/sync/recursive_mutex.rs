//! A re-entrant variant of [`FiberMutex`](super::FiberMutex).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex as StdMutex;

use crate::error::Result;
use crate::fiber::{self, Fiber};

use super::WaitQueue;

struct State {
    owner: Option<Fiber>,
    recursion: u32,
    waiters: WaitQueue,
}

/// Like [`FiberMutex`](super::FiberMutex), but the owning fiber may lock it
/// again without deadlocking itself; the lock is only actually released
/// once the recursion count returns to zero.
pub struct RecursiveFiberMutex<T: ?Sized> {
    state: StdMutex<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RecursiveFiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for RecursiveFiberMutex<T> {}

impl<T> RecursiveFiberMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: StdMutex::new(State {
                owner: None,
                recursion: 0,
                waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RecursiveFiberMutex<T> {
    pub fn lock(&self) -> Result<RecursiveFiberMutexGuard<'_, T>> {
        let me = fiber::current().expect("RecursiveFiberMutex::lock called outside a running fiber");
        let mut state = self.state.lock().unwrap();
        match &state.owner {
            Some(owner) if owner == &me => {
                state.recursion += 1;
                return Ok(RecursiveFiberMutexGuard { mutex: self });
            }
            None => {
                state.owner = Some(me);
                state.recursion = 1;
                return Ok(RecursiveFiberMutexGuard { mutex: self });
            }
            Some(_) => {}
        }
        state.waiters.push();
        drop(state);
        super::park()?;
        // We were handed ownership with recursion freshly reset to 1 by
        // whichever `unlock` woke us.
        Ok(RecursiveFiberMutexGuard { mutex: self })
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap();
        state.recursion -= 1;
        if state.recursion > 0 {
            return;
        }
        match state.waiters.pop() {
            Some(next) => {
                state.owner = Some(next.fiber.clone());
                state.recursion = 1;
                drop(state);
                next.wake();
            }
            None => {
                state.owner = None;
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + Default> Default for RecursiveFiberMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct RecursiveFiberMutexGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveFiberMutex<T>,
}

impl<T: ?Sized> Drop for RecursiveFiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized> Deref for RecursiveFiberMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RecursiveFiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn same_fiber_can_relock() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let m = RecursiveFiberMutex::new(0);
            let outer = m.lock().unwrap();
            {
                let mut inner = m.lock().unwrap();
                *inner = 7;
            }
            assert_eq!(*outer, 7);
        });
        scheduler.stop();
    }
}
