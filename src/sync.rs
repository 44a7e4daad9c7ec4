//! Fiber-aware synchronization primitives.
//!
//! Every primitive here shares the same shape: a `std::sync::Mutex` guards
//! a small piece of metadata (owner, permit count, signalled flag, …) plus
//! a FIFO list of parked waiters; a waiter is a `(Scheduler, Fiber)` pair
//! recorded at the moment it parks, so that releasing the primitive can
//! hand control straight back to the scheduler — and, if pinned, the OS
//! thread — the waiter was parked on, never wherever the releaser happens
//! to be running. None of this blocks an OS thread: parking means
//! appending to the waiter list and calling [`crate::scheduler::yield_to`],
//! which only yields to the current fiber's dispatcher.

pub mod condition;
pub mod event;
pub mod mutex;
pub mod recursive_mutex;
pub mod semaphore;

pub use condition::FiberCondition;
pub use event::FiberEvent;
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use recursive_mutex::RecursiveFiberMutex;
pub use semaphore::FiberSemaphore;

use std::collections::VecDeque;

use crate::error::Result;
use crate::fiber::{self, Fiber};
use crate::scheduler::{self, Scheduler};

/// A fiber parked on some primitive, recorded together with the scheduler
/// it must be rescheduled on when woken — possibly pinned to the OS thread
/// it parked on, so a primitive released from a different worker still
/// hands the waiter back to wherever it's allowed to run.
pub(crate) struct Waiter {
    scheduler: Scheduler,
    fiber: Fiber,
}

impl Waiter {
    /// Captures the calling fiber and its scheduler. Panics (a programming
    /// error, like the rest of this crate's preconditions) if called
    /// outside a fiber owned by a scheduler.
    pub(crate) fn current() -> Self {
        let fiber = fiber::current().expect("sync primitive used outside a running fiber");
        let scheduler = scheduler::current().expect("sync primitive used outside a scheduler");
        Self { scheduler, fiber }
    }

    /// Hands the waiter back to its scheduler for resumption.
    pub(crate) fn wake(self) {
        self.scheduler.schedule_fiber(self.fiber);
    }
}

/// FIFO queue of parked waiters, shared by every primitive in this module.
#[derive(Default)]
pub(crate) struct WaitQueue(VecDeque<Waiter>);

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self(VecDeque::new())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self) {
        self.0.push_back(Waiter::current());
    }

    /// Appends an already-captured waiter, e.g. one moved over from
    /// another primitive's queue (see [`crate::sync::FiberCondition`]).
    pub(crate) fn push_waiter(&mut self, waiter: Waiter) {
        self.0.push_back(waiter);
    }

    /// Wakes the head of the queue, if any. Returns whether someone was
    /// woken.
    pub(crate) fn wake_one(&mut self) -> bool {
        match self.0.pop_front() {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter currently in the queue.
    pub(crate) fn wake_all(&mut self) {
        while self.wake_one() {}
    }

    pub(crate) fn pop(&mut self) -> Option<Waiter> {
        self.0.pop_front()
    }
}

/// Parks the current fiber: the caller must have already pushed it onto
/// whichever `WaitQueue` is relevant and released any native lock, since
/// this suspends the fiber until some other fiber reschedules it.
fn park() -> Result<()> {
    scheduler::yield_to()
}
