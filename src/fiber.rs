//! Stackful coroutines.
//!
//! A [`Fiber`] is an independent thread of control with its own stack. Unlike
//! an `async fn`, a fiber can suspend from *any* call depth — including deep
//! inside a library function that knows nothing about cooperative scheduling
//! — because suspending means swapping the machine's stack pointer and
//! callee-saved registers rather than threading a `Future::poll` state
//! machine through the type system.
//!
//! This module only deals with the primitive itself: allocation, context
//! switching, exception injection and fiber-local storage. Multiplexing many
//! fibers over a pool of OS threads is [`crate::scheduler`]'s job.
pub mod context;
pub mod csw;
pub mod local;
pub mod safety;
pub mod stack;

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub use csw::{check_yield, csw, YieldResult};
pub use local::Key as FlsKey;

use context::{Context, Trampoline};
use local::Slots;
use stack::{Stack, DEFAULT_STACK_SIZE};

use crate::error::{Error, Result};

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// The lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Not yet started, or reset; the next `call`/`yield_to` runs `entry`
    /// from the beginning.
    Init = 0,
    /// Currently the one fiber executing on its OS thread.
    Exec = 1,
    /// Suspended; sitting on some wait list or a scheduler's ready queue.
    Hold = 2,
    /// `entry` returned normally. Terminal.
    Term = 3,
    /// `entry` panicked, or the fiber unwound due to an injected
    /// cancellation it didn't catch. Terminal.
    Except = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Init,
            1 => State::Exec,
            2 => State::Hold,
            3 => State::Term,
            4 => State::Except,
            _ => unreachable!("invalid fiber state byte"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

type Entry = Box<dyn FnOnce() + Send>;

struct Inner {
    state: AtomicU8,
    // `None` for thread-adopting root fibers, which run on the OS thread's
    // native stack.
    stack: Option<Stack>,
    // Only ever touched by the single OS thread currently switching into or
    // out of this fiber; at most one fiber is Exec at a time, which is what
    // makes sharing this behind `Arc` sound.
    context: RefCell<Context>,
    entry: Mutex<Option<Entry>>,
    outer: Mutex<Option<Weak<Inner>>>,
    transferee: Mutex<Option<Weak<Inner>>>,
    resumed_by: Mutex<Option<Fiber>>,
    pending_error: Mutex<Option<Error>>,
    fls: safety::NoYieldsRefCell<Slots>,
    switches: AtomicU64,
    name: Box<str>,
}

// Safety: the `RefCell`/`Mutex`-guarded fields are only ever touched by
// whichever single OS thread currently has this fiber in the Exec state.
unsafe impl Sync for Inner {}

/// A handle to a stackful coroutine.
///
/// Cheap to clone (reference counted); all clones refer to the same
/// underlying execution context, mirroring a `shared_ptr<Fiber>` handle.
#[derive(Clone)]
pub struct Fiber(Arc<Inner>);

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &&*self.0.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Creates a new fiber in state [`State::Init`] with the default stack
    /// size.
    pub fn new<F>(name: impl Into<String>, entry: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(name, DEFAULT_STACK_SIZE, entry)
    }

    /// Like [`Fiber::new`], but with an explicit stack size in bytes.
    pub fn with_stack_size<F>(name: impl Into<String>, stack_size: usize, entry: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::new(stack_size)?;
        let inner = Arc::new(Inner {
            state: AtomicU8::new(State::Init as u8),
            stack: Some(stack),
            context: RefCell::new(Context::empty()),
            entry: Mutex::new(Some(Box::new(entry))),
            outer: Mutex::new(None),
            transferee: Mutex::new(None),
            resumed_by: Mutex::new(None),
            pending_error: Mutex::new(None),
            fls: safety::NoYieldsRefCell::new(Slots::default()),
            switches: AtomicU64::new(0),
            name: name.into().into_boxed_str(),
        });
        arm(&inner);
        Ok(Self(inner))
    }

    /// Wraps the calling OS thread's native stack as a root fiber, so that
    /// [`current`]/[`with_current`] and fiber-local storage work on threads
    /// that were never switched into from another fiber (e.g. a freshly
    /// spawned scheduler worker thread).
    ///
    /// # Safety
    /// Must be called at most once per OS thread, and before any fiber is
    /// switched into on this thread.
    pub unsafe fn new_thread_adopting(name: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            state: AtomicU8::new(State::Exec as u8),
            stack: None,
            context: RefCell::new(Context::empty()),
            entry: Mutex::new(None),
            outer: Mutex::new(None),
            transferee: Mutex::new(None),
            resumed_by: Mutex::new(None),
            pending_error: Mutex::new(None),
            fls: safety::NoYieldsRefCell::new(Slots::default()),
            switches: AtomicU64::new(0),
            name: name.into().into_boxed_str(),
        });
        let fiber = Self(inner);
        CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));
        fiber
    }

    /// Resets a terminated (or freshly-constructed) fiber back to
    /// [`State::Init`] with a new entry point, reusing its stack.
    ///
    /// If the fiber is currently suspended ([`State::Hold`]), it is first
    /// unwound by injecting [`Error::Cancelled`] and running it to
    /// completion, mirroring the cleanup a `Fiber`'s destructor would
    /// otherwise have to perform.
    ///
    /// # Panics
    /// If called while the fiber is [`State::Exec`].
    pub fn reset<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state() == State::Exec {
            panic!("cannot reset a fiber that is currently executing");
        }
        let _ = self.unwind_if_held();
        *self.0.entry.lock().unwrap() = Some(Box::new(entry));
        *self.0.pending_error.lock().unwrap() = None;
        self.set_state(State::Init);
        arm(&self.0);
        Ok(())
    }

    /// Explicitly cancels and runs a [`State::Hold`] fiber to completion,
    /// injecting [`Error::Cancelled`] and resuming it once so any
    /// `catch`-style cleanup along its suspended stack runs before it's
    /// dropped. A no-op for a fiber that isn't `Hold`. Any exception
    /// produced while unwinding (including the cancellation itself, if
    /// uncaught) is swallowed, matching the reference implementation's
    /// "exceptions produced while destroying are swallowed".
    ///
    /// Rust has no destructor hook equivalent to the reference
    /// implementation's "inject-and-run on destruction": by the time
    /// `Inner`'s `Drop` impl runs, the last `Arc<Inner>` is already gone,
    /// so there is no sound way to resurrect a `Fiber` handle to `call()`
    /// with. Call this explicitly before dropping a `Hold` fiber you own;
    /// [`Fiber::reset`] already does so internally when reusing one.
    /// Dropping a fiber that's still `Hold` without calling this first
    /// only logs a diagnostic; it does not run the cleanup for you.
    pub fn cancel_and_join(&self) {
        let _ = self.unwind_if_held();
    }

    fn unwind_if_held(&self) -> Result<()> {
        if self.state() == State::Hold {
            self.inject(Error::Cancelled);
            return self.call();
        }
        Ok(())
    }

    /// Resumes this fiber as a child of the current one, returning once it
    /// yields or terminates. If it terminated with an unhandled error
    /// (including a relayed panic), that error is returned here.
    pub fn call(&self) -> Result<()> {
        assert!(
            matches!(self.state(), State::Init | State::Hold),
            "call() requires the target to be in Init or Hold state, was {:?}",
            self.state()
        );
        let caller = current().expect("call() requires a currently executing fiber");
        *self.0.outer.lock().unwrap() = Some(Arc::downgrade(&caller.0));
        switch_into(self, &caller);
        caller.take_pending_error()
    }

    /// Resumes this fiber directly, without registering the caller as its
    /// `outer` (so a later [`yield_now`] inside `self` won't return here).
    ///
    /// If `return_on_terminate` is set, control returns to the caller
    /// implicitly once `self` (or whatever it `yield_to`s into next) runs to
    /// completion; otherwise termination is the callee's business.
    ///
    /// Returns the fiber that actually switched back into the caller, which
    /// may not be `self` if intervening `yield_to` calls handed control
    /// somewhere else first.
    pub fn yield_to(&self, return_on_terminate: bool) -> Result<Fiber> {
        assert!(
            matches!(self.state(), State::Init | State::Hold),
            "yield_to() requires the target to be in Init or Hold state, was {:?}",
            self.state()
        );
        let caller = current().expect("yield_to() requires a currently executing fiber");
        if return_on_terminate {
            *self.0.transferee.lock().unwrap() = Some(Arc::downgrade(&caller.0));
        }
        switch_into(self, &caller);
        let resumer = caller.0.resumed_by.lock().unwrap().take();
        caller.take_pending_error()?;
        Ok(resumer.unwrap_or(caller))
    }

    /// Schedules `error` to be raised in this fiber's control flow the next
    /// time it is resumed, regardless of what suspension point it is parked
    /// at. The fiber observes it as the `Err` returned from whatever
    /// `yield_now`/wait call it is blocked in.
    pub fn inject(&self, error: Error) {
        log::trace!("fiber {:?} had a cancellation injected", &*self.0.name);
        *self.0.pending_error.lock().unwrap() = Some(error);
    }

    /// The fiber's current lifecycle state.
    pub fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        log::trace!("fiber {:?} -> {:?}", &*self.0.name, state);
        self.0.state.store(state as u8, Ordering::Release);
    }

    fn take_pending_error(&self) -> Result<()> {
        match self.0.pending_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of context switches this fiber has been through (yielded and
    /// been resumed). Used by [`csw`]/[`check_yield`] and the no-yield
    /// guards in [`safety`].
    pub fn switch_count(&self) -> u64 {
        self.0.switches.load(Ordering::Relaxed)
    }

    /// The fiber that most recently switched into this one.
    ///
    /// For a task handed to [`crate::scheduler::Scheduler`], this is the
    /// worker's dispatcher fiber; [`crate::scheduler::yield_to`] reads it
    /// to find out who to hand control back to without consuming it (a
    /// fiber may give control back to its dispatcher many times over its
    /// lifetime).
    pub fn resumed_by(&self) -> Option<Fiber> {
        self.0.resumed_by.lock().unwrap().clone()
    }

    /// This fiber's name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn fls_get(&self, key: FlsKey) -> usize {
        self.0.fls.borrow().get(key)
    }

    fn fls_set(&self, key: FlsKey, value: usize) {
        self.0.fls.borrow_mut().set(key, value);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = State::from_u8(*self.state.get_mut());
        debug_assert!(state != State::Exec, "a fiber must never be dropped while it is Exec");
        if state == State::Hold {
            log::debug!(
                "fiber {:?} dropped while still suspended; call `Fiber::cancel_and_join` \
                 before dropping to let its stack unwind through any cleanup",
                &*self.name
            );
        }
    }
}

/// Lays out the initial machine context for a fiber in [`State::Init`].
/// No-op for thread-adopting root fibers, which have no stack of their own.
fn arm(inner: &Arc<Inner>) {
    let Some(stack) = &inner.stack else {
        return;
    };
    let arg = Box::into_raw(Box::new(Fiber(inner.clone()))) as *mut ();
    // Safety: `stack` was just allocated by `Stack::new` for exclusive use
    // by this context, and is at least `MIN_STACK_SIZE` bytes.
    let ctx = unsafe { Context::new(stack.base(), stack.len(), trampoline as Trampoline, arg) };
    *inner.context.borrow_mut() = ctx;
}

/// The function every non-root fiber starts executing at on its first
/// switch-in. Runs the user's entry closure, converts a panic into a
/// relayed [`Error::Panicked`], and implicitly switches to whoever should
/// receive control once this fiber terminates.
unsafe extern "C" fn trampoline(arg: *mut ()) -> ! {
    let fiber = *Box::from_raw(arg as *mut Fiber);
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber.clone()));

    let entry = fiber
        .0
        .entry
        .lock()
        .unwrap()
        .take()
        .expect("fiber entered with no entry point set");

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
        Ok(()) => fiber.set_state(State::Term),
        Err(payload) => {
            *fiber.0.pending_error.lock().unwrap() = Some(Error::Panicked(SharedPanic(Arc::new(payload))));
            fiber.set_state(State::Except);
        }
    }

    let target = fiber
        .0
        .transferee
        .lock()
        .unwrap()
        .take()
        .and_then(|w| w.upgrade())
        .map(Fiber)
        .or_else(|| fiber.0.outer.lock().unwrap().take().and_then(|w| w.upgrade()).map(Fiber))
        .expect("a terminating fiber must have somewhere to return control to");

    terminal_switch_into(&target, &fiber);
    unreachable!("a terminated fiber must never be resumed")
}

/// Suspends `caller` (transitioning it to [`State::Hold`]) and resumes
/// `target`. Used for an ordinary suspension, where `caller` is expected to
/// run again later — as opposed to [`terminal_switch_into`], used when the
/// fiber giving up control has already terminated and must keep its
/// [`State::Term`]/[`State::Except`] state rather than being marked `Hold`.
fn switch_into(target: &Fiber, caller: &Fiber) {
    caller.set_state(State::Hold);
    raw_switch(caller, target);
}

/// Like [`switch_into`], but for a fiber (`terminated`) that has just run
/// its entry to completion or panicked: its state (already `Term`/`Except`,
/// set by the [`trampoline`]) is left untouched rather than being
/// overwritten to `Hold`, and any exception it captured is handed to
/// `target` — whose own `call`/`yield_to` invocation is what's waiting on
/// the other side of this switch, and reads it back out via
/// `take_pending_error` once the switch returns control there.
fn terminal_switch_into(target: &Fiber, terminated: &Fiber) {
    if let Some(e) = terminated.0.pending_error.lock().unwrap().take() {
        *target.0.pending_error.lock().unwrap() = Some(e);
    }
    raw_switch(terminated, target);
}

/// Core context switch: `from` suspends, `to` is resumed. Updates the
/// `CURRENT` thread-local and the `resumed_by`/`switches` bookkeeping
/// `call`/`yield_to` read once the switch back to `from` eventually
/// happens. Does not touch either fiber's [`State`] beyond marking `to`
/// [`State::Exec`] — callers decide what `from`'s state becomes.
fn raw_switch(from: &Fiber, to: &Fiber) {
    *to.0.resumed_by.lock().unwrap() = Some(from.clone());
    to.set_state(State::Exec);
    from.0.switches.fetch_add(1, Ordering::Relaxed);
    CURRENT.with(|c| *c.borrow_mut() = Some(to.clone()));

    // Safety: the Exec invariant guarantees `from` and `to` are never both
    // the running fiber on this thread at once, so these borrows never
    // alias a concurrent switch on the same context.
    unsafe {
        let from_ctx = &mut *from.0.context.as_ptr();
        let to_ctx = &*to.0.context.as_ptr();
        Context::switch(from_ctx, to_ctx);
    }
    // Execution resumes here once some other switch targets `from` again;
    // whichever switch did that has already updated CURRENT.
}

/// A panic payload captured across a fiber boundary. Wrapped in `Arc` so
/// [`Error`] can stay `Clone`-free-to-derive without requiring `Box<dyn Any>`
/// itself to be `Clone`.
#[derive(Clone)]
pub struct SharedPanic(pub Arc<Box<dyn Any + Send>>);

impl std::fmt::Debug for SharedPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&panic_message(&self.0))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local accessors
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on this OS thread, if any.
pub fn current() -> Option<Fiber> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Runs `f` with the currently executing fiber.
///
/// # Panics
/// If no fiber is currently executing on this thread (i.e. neither a fiber
/// nor [`Fiber::new_thread_adopting`] has ever run here).
pub fn with_current<R>(f: impl FnOnce(&Fiber) -> R) -> R {
    CURRENT.with(|c| {
        let borrowed = c.borrow();
        let fiber = borrowed
            .as_ref()
            .expect("no fiber is currently executing on this thread");
        f(fiber)
    })
}

/// Suspends the current fiber, returning control to whoever resumed it via
/// [`Fiber::call`].
///
/// # Panics
/// If there is no current fiber, or the current fiber was not resumed via
/// `call` (e.g. it's a thread-adopting root fiber, or was resumed via
/// `yield_to` instead).
pub fn yield_now() -> Result<()> {
    let this = current().expect("yield_now() requires a currently executing fiber");
    let outer = this
        .0
        .outer
        .lock()
        .unwrap()
        .clone()
        .and_then(|w| w.upgrade())
        .map(Fiber)
        .expect("yield_now() requires the current fiber to have been resumed via call()");
    switch_into(&outer, &this);
    this.take_pending_error()
}

////////////////////////////////////////////////////////////////////////////////
// Fiber-local storage
////////////////////////////////////////////////////////////////////////////////

/// Allocates a new fiber-local storage key, analogous to thread-local
/// storage but keyed on the currently executing fiber instead of the OS
/// thread.
pub fn fls_alloc() -> FlsKey {
    local::alloc()
}

/// Returns a fiber-local storage key to the process-wide registry for
/// reuse.
pub fn fls_free(key: FlsKey) {
    local::free(key)
}

/// Reads `key`'s slot for the currently executing fiber. Reads as `0` for a
/// fiber that has never written to it.
pub fn fls_get(key: FlsKey) -> usize {
    with_current(|f| f.fls_get(key))
}

/// Writes `key`'s slot for the currently executing fiber.
pub fn fls_set(key: FlsKey, value: usize) {
    with_current(|f| f.fls_set(key, value))
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn call_and_yield_now() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let child = Fiber::new("child", || {
                yield_now().unwrap();
            })
            .unwrap();
            assert_eq!(child.state(), State::Init);
            child.call().unwrap();
            assert_eq!(child.state(), State::Hold);
            child.call().unwrap();
            assert_eq!(child.state(), State::Term);
        });
    }

    #[test]
    fn panic_is_relayed_to_caller() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let child = Fiber::new("panics", || panic!("boom")).unwrap();
            let err = child.call().unwrap_err();
            assert!(matches!(err, Error::Panicked(_)));
            assert_eq!(child.state(), State::Except);
        });
    }

    #[test]
    fn reset_reuses_a_terminated_fiber() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let fiber = Fiber::new("reusable", || {}).unwrap();
            fiber.call().unwrap();
            assert_eq!(fiber.state(), State::Term);
            fiber.reset(|| {}).unwrap();
            assert_eq!(fiber.state(), State::Init);
            fiber.call().unwrap();
            assert_eq!(fiber.state(), State::Term);
        });
    }

    #[test]
    fn cancel_and_join_unwinds_through_cleanup() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let cleaned_up = Arc::new(AtomicBool::new(false));
            let cleaned_up_in_fiber = Arc::clone(&cleaned_up);

            struct RunsOnDrop(Arc<AtomicBool>);
            impl Drop for RunsOnDrop {
                fn drop(&mut self) {
                    self.0.store(true, Ordering::Relaxed);
                }
            }

            let fiber = Fiber::new("cancellable", move || {
                let _cleanup = RunsOnDrop(cleaned_up_in_fiber);
                loop {
                    match yield_now() {
                        Ok(()) => continue,
                        Err(e) => {
                            assert!(e.is_cancelled());
                            return;
                        }
                    }
                }
            })
            .unwrap();

            fiber.call().unwrap();
            assert_eq!(fiber.state(), State::Hold);
            assert!(!cleaned_up.load(Ordering::Relaxed));

            fiber.cancel_and_join();
            assert_eq!(fiber.state(), State::Term);
            assert!(cleaned_up.load(Ordering::Relaxed));
        });
    }

    #[test]
    fn fls_is_private_per_fiber() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            let key = fls_alloc();
            fls_set(key, 11);
            let child = Fiber::new("fls-child", move || {
                assert_eq!(fls_get(key), 0);
                fls_set(key, 22);
                assert_eq!(fls_get(key), 22);
            })
            .unwrap();
            child.call().unwrap();
            assert_eq!(fls_get(key), 11);
            fls_free(key);
        });
    }
}
