//! M-on-N dispatch: multiplexing many [fibers](crate::fiber) over a fixed
//! pool of OS threads.
//!
//! A [`Scheduler`] owns one FIFO queue of [tasks](Task), shared by all of
//! its workers, plus (optionally) the thread that constructed it. Each
//! worker runs [`run_worker`]'s dispatch loop: pop a batch of ready tasks,
//! resume each one as a fiber, and fall back to [`idle::Idle::run`] when
//! there's nothing to do. A fiber parked on a sync primitive or a
//! [`Future`](crate::future::Future) is handed back to its scheduler by
//! whoever releases it, always landing on the scheduler it was waiting
//! from — never on whatever worker happens to run the releaser.
//!
//! This module is the collaborator every other piece of the crate is
//! built on top of: [`crate::sync`] primitives reschedule their waiters
//! through it, [`crate::future`] futures run their delivery callback on
//! it, and [`crate::parallel`] is a thin facade over spawning fibers on
//! one.

pub mod idle;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

pub use idle::{DefaultIdle, Idle};

use crate::error::{Error, Result};
use crate::fiber::safety::NoYieldsGuard;
use crate::fiber::{self, Fiber, State};

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// A unit of work submitted to a [`Scheduler`]: either an existing fiber
/// to resume, or a callable the worker runs on its cached dispatch fiber.
enum TaskBody {
    Fiber(Fiber),
    Callable(Box<dyn FnOnce() + Send>),
}

/// A queued [`TaskBody`] plus the thread it's pinned to, if any.
struct Task {
    body: TaskBody,
    target_thread: Option<ThreadId>,
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

struct WorkerSlot {
    thread_id: ThreadId,
    idle_fiber: Fiber,
    exit_requested: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    idle_impl: Box<dyn Idle>,
    batch_size: usize,
    use_caller: bool,
    requested_threads: usize,
    stop_requested: AtomicBool,
    active_workers: AtomicUsize,
    started: AtomicBool,
    root_thread: Mutex<Option<ThreadId>>,
    workers: Mutex<Vec<WorkerSlot>>,
}

/// Multiplexes [`Fiber`]s over a fixed pool of OS threads.
///
/// Cheap to clone; all clones refer to the same queue and worker roster.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Scheduler {}

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    static DISPATCH_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
    static ROOT_IDLE_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

impl Scheduler {
    /// Creates a scheduler with `threads` dedicated worker threads (none
    /// of them the caller's). Workers are spawned immediately.
    pub fn new(threads: usize, batch_size: usize) -> Self {
        Self::build(threads, false, batch_size)
    }

    /// Creates a scheduler that adopts the constructing thread as one of
    /// its `threads` workers. `threads - 1` dedicated workers are spawned
    /// immediately; the hijacked thread's own dispatch loop only runs
    /// when [`Scheduler::dispatch`] or [`Scheduler::stop`] is called on
    /// it, per the spec's "must be stopped from that thread" constraint.
    pub fn new_hijacking(threads: usize, batch_size: usize) -> Self {
        Self::build(threads, true, batch_size)
    }

    fn build(threads: usize, use_caller: bool, batch_size: usize) -> Self {
        assert!(threads >= 1, "a scheduler needs at least one thread");
        assert!(batch_size >= 1, "batch_size must be at least 1");
        let scheduler = Self(Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            idle_impl: Box::new(DefaultIdle::new()),
            batch_size,
            use_caller,
            requested_threads: threads,
            stop_requested: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            root_thread: Mutex::new(if use_caller {
                Some(thread::current().id())
            } else {
                None
            }),
            workers: Mutex::new(Vec::new()),
        }));
        scheduler.start();
        scheduler
    }

    /// Idempotent: spawns the configured worker threads on first call.
    /// The hijacked thread (if any) is not among them — it only runs its
    /// loop inside [`Scheduler::dispatch`]/[`Scheduler::stop`].
    pub fn start(&self) {
        if self.0.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let spawned = if self.0.use_caller {
            self.0.requested_threads - 1
        } else {
            self.0.requested_threads
        };
        for _ in 0..spawned {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        let scheduler = self.clone();
        let exit_requested = Arc::new(AtomicBool::new(false));
        let exit_for_thread = exit_requested.clone();
        // Placeholder entry; overwritten by `register_worker` below.
        let idle_fiber = Fiber::new("idle", || {}).expect("failed to allocate idle fiber stack");
        let idle_for_registration = idle_fiber.clone();
        let join = thread::Builder::new()
            .name("fiber-scheduler-worker".into())
            .spawn(move || run_worker(scheduler, false, exit_for_thread))
            .expect("failed to spawn scheduler worker thread");
        // We don't know the spawned thread's `ThreadId` until it runs, so
        // the slot is registered by the worker itself via
        // `register_worker`; here we only remember the join handle keyed
        // by the fiber we handed it, matched up inside `register_worker`.
        self.0.workers.lock().unwrap().push(WorkerSlot {
            thread_id: join.thread().id(),
            idle_fiber: idle_for_registration,
            exit_requested,
            join: Some(join),
        });
        drop(idle_fiber);
    }

    /// Requests shutdown.
    ///
    /// For a spawned-only scheduler this may be called from any thread;
    /// it returns once every worker has drained its queue and exited.
    /// For a hijacking scheduler it must be called from the hijacked
    /// thread, where it pumps the dispatch loop to completion before
    /// returning; calling it from another fiber owned by this scheduler
    /// only marks it stopping (the hijacked thread notices on its next
    /// pass).
    pub fn stop(&self) {
        self.0.stop_requested.store(true, Ordering::Release);
        self.tickle_all();

        let is_root_thread = self
            .0
            .root_thread
            .lock()
            .unwrap()
            .map_or(false, |root| root == thread::current().id());

        if self.0.use_caller && is_root_thread {
            run_worker(self.clone(), true, Arc::new(AtomicBool::new(false)));
        } else if self.0.use_caller {
            // Marked stopping above; the hijacked thread drains on its own.
            return;
        }

        let joins: Vec<_> = self
            .0
            .workers
            .lock()
            .unwrap()
            .iter_mut()
            .filter_map(|w| w.join.take())
            .collect();
        for j in joins {
            let _ = j.join();
        }
    }

    /// `true` once shutdown has been requested, the queue is empty and no
    /// worker is actively running a task.
    pub fn stopping(&self) -> bool {
        self.0.stop_requested.load(Ordering::Acquire)
            && self.queue_is_empty()
            && self.0.active_workers.load(Ordering::Acquire) == 0
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.0.queue.lock().unwrap().is_empty()
    }

    /// Wakes one worker (if any is idle). Called automatically by
    /// `schedule*`; exposed for derived schedulers to call after pushing
    /// work through some other channel.
    pub fn tickle(&self) {
        self.0.idle_impl.notify();
    }

    fn tickle_all(&self) {
        // `DefaultIdle::notify` is a condvar broadcast, so one call
        // already wakes every worker parked in `Idle::run`; a derived
        // `Idle` that only wakes one waiter per `notify()` should
        // override this too via its own `tickle()` if it needs to.
        self.tickle();
    }

    /// Submits `fiber` to be resumed by whichever worker picks it up.
    pub fn schedule_fiber(&self, fiber: Fiber) {
        self.schedule_task(TaskBody::Fiber(fiber), None)
    }

    /// Like [`Scheduler::schedule_fiber`], but only a worker whose OS
    /// thread matches `thread` may run it.
    pub fn schedule_fiber_on(&self, fiber: Fiber, thread: ThreadId) {
        self.schedule_task(TaskBody::Fiber(fiber), Some(thread))
    }

    /// Submits `f` to run on some worker's cached dispatch fiber.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(TaskBody::Callable(Box::new(f)), None)
    }

    /// Batch-submits many fibers with a single tickle at the end.
    pub fn schedule_many(&self, fibers: impl IntoIterator<Item = Fiber>) {
        let mut queue = self.0.queue.lock().unwrap();
        for fiber in fibers {
            queue.push_back(Task {
                body: TaskBody::Fiber(fiber),
                target_thread: None,
            });
        }
        drop(queue);
        if !self.is_current() {
            self.tickle();
        }
    }

    fn schedule_task(&self, body: TaskBody, target_thread: Option<ThreadId>) {
        if let Some(t) = target_thread {
            let known = t == self.0.root_thread.lock().unwrap().unwrap_or(t)
                || self.0.workers.lock().unwrap().iter().any(|w| w.thread_id == t);
            debug_assert!(known, "target_thread must be this scheduler's root or a spawned worker");
        }
        self.0.queue.lock().unwrap().push_back(Task { body, target_thread });
        // Re-entrant schedule from inside this very scheduler doesn't
        // tickle: the current worker picks the new item up on its next
        // dispatch pass.
        if !self.is_current() {
            self.tickle();
        }
    }

    fn is_current(&self) -> bool {
        current().map_or(false, |s| s == *self)
    }

    /// Number of live worker threads, including the hijacked one if any.
    pub fn thread_count(&self) -> usize {
        let spawned = self.0.workers.lock().unwrap().len();
        if self.0.use_caller {
            spawned + 1
        } else {
            spawned
        }
    }

    /// Live-resizes the worker pool. Growing spawns new workers
    /// immediately; shrinking asks the most-recently-spawned workers to
    /// exit by injecting a cancellation into their idle fiber and waits
    /// for them to join.
    pub fn set_thread_count(&self, n: usize) {
        let floor = if self.0.use_caller { 1 } else { 0 };
        assert!(n >= floor, "cannot shrink below the hijacked thread");
        let target_spawned = n - floor;
        let current_spawned = self.0.workers.lock().unwrap().len();
        log::debug!("resizing worker pool: {current_spawned} -> {target_spawned} spawned workers");
        match target_spawned.cmp(&current_spawned) {
            std::cmp::Ordering::Greater => {
                for _ in current_spawned..target_spawned {
                    self.spawn_worker();
                }
            }
            std::cmp::Ordering::Less => {
                let excess = {
                    let mut workers = self.0.workers.lock().unwrap();
                    workers.split_off(target_spawned)
                };
                for w in excess {
                    w.exit_requested.store(true, Ordering::Release);
                    w.idle_fiber.inject(Error::Cancelled);
                    self.tickle();
                    if let Some(j) = w.join {
                        let _ = j.join();
                    }
                }
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    /// Runs `f` as a task pinned to the calling (hijacked) thread, then
    /// pumps this scheduler's dispatch loop on this thread until no more
    /// work is immediately available. Only valid for a hijacking
    /// scheduler, called from the hijacked thread.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(self.0.use_caller, "dispatch() requires a hijacking scheduler");
        let this_thread = thread::current().id();
        assert_eq!(
            self.0.root_thread.lock().unwrap(),
            Some(this_thread),
            "dispatch() must be called from the hijacking thread"
        );
        self.schedule_task(TaskBody::Callable(Box::new(f)), Some(this_thread));
        self.pump_until_idle();
    }

    fn pump_until_idle(&self) {
        let this_thread = thread::current().id();
        ensure_root_fiber();
        loop {
            let (batch, tickle_me) = self.take_batch(this_thread);
            if tickle_me {
                self.tickle();
            }
            if batch.is_empty() {
                break;
            }
            self.0.active_workers.fetch_add(1, Ordering::AcqRel);
            run_batch(self, batch);
            self.0.active_workers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn take_batch(&self, this_thread: ThreadId) -> (Vec<Task>, bool) {
        // The queue lock protects the queue only, per the locking
        // discipline every fiber-sync primitive in this crate follows;
        // nothing under it may yield.
        let _guard = NoYieldsGuard::with_message("scheduler queue lock held across a yield");
        let mut queue = self.0.queue.lock().unwrap();
        let mut batch = Vec::new();
        let mut tickle_me = false;
        let mut i = 0;
        while i < queue.len() && batch.len() < self.0.batch_size {
            let skip = match &queue[i].target_thread {
                Some(t) if *t != this_thread => true,
                _ => match &queue[i].body {
                    TaskBody::Fiber(f) => f.state() == State::Exec,
                    TaskBody::Callable(_) => false,
                },
            };
            if skip {
                tickle_me = true;
                i += 1;
                continue;
            }
            batch.push(queue.remove(i).expect("index was just bounds-checked"));
        }
        (batch, tickle_me)
    }
}

/// The scheduler currently active on this OS thread, if any.
pub fn current() -> Option<Scheduler> {
    CURRENT.with(|c| c.borrow().clone())
}

fn ensure_root_fiber() {
    if fiber::current().is_none() {
        // Safety: this thread has never had a fiber established, since
        // `fiber::current()` just returned `None`.
        unsafe {
            fiber::Fiber::new_thread_adopting("scheduler-root");
        }
    }
}

fn dispatch_fiber() -> Fiber {
    DISPATCH_FIBER.with(|d| {
        let mut slot = d.borrow_mut();
        if let Some(f) = slot.as_ref() {
            return f.clone();
        }
        let f = Fiber::new("dispatch", || {}).expect("failed to allocate dispatch fiber stack");
        *slot = Some(f.clone());
        f
    })
}

/// Suspends the current fiber, handing control back to its worker's
/// dispatcher without rescheduling it — some sync primitive's waiter list
/// is expected to reschedule it later.
pub fn yield_to() -> Result<()> {
    let me = fiber::current().expect("scheduler::yield_to requires a currently executing fiber");
    let dispatcher = me
        .resumed_by()
        .expect("scheduler::yield_to requires the fiber to be owned by a scheduler worker");
    dispatcher.yield_to(true).map(|_| ())
}

/// Re-enqueues the current fiber on its scheduler, then yields to the
/// worker's dispatcher.
pub fn yield_now() -> Result<()> {
    let me = fiber::current().expect("scheduler::yield_now requires a currently executing fiber");
    let scheduler = current().expect("scheduler::yield_now requires an active Scheduler on this thread");
    scheduler.schedule_fiber(me);
    yield_to()
}

/// Reschedules the current fiber on `scheduler` (optionally pinned to
/// `target_thread`) and yields, migrating it there even if `scheduler` is
/// a different instance than the one currently running it.
pub fn switch_to(scheduler: &Scheduler, target_thread: Option<ThreadId>) -> Result<()> {
    let me = fiber::current().expect("switch_to requires a currently executing fiber");
    match target_thread {
        Some(t) => scheduler.schedule_fiber_on(me, t),
        None => scheduler.schedule_fiber(me),
    }
    yield_to()
}

////////////////////////////////////////////////////////////////////////////////
// Worker dispatch loop
////////////////////////////////////////////////////////////////////////////////

fn run_worker(scheduler: Scheduler, is_hijacked_root: bool, exit_requested: Arc<AtomicBool>) {
    ensure_root_fiber();
    CURRENT.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
    let this_thread = thread::current().id();

    let idle_fiber = if is_hijacked_root {
        Some(root_idle_fiber(&scheduler))
    } else {
        register_idle_fiber(&scheduler, this_thread);
        find_idle_fiber(&scheduler, this_thread)
    };

    loop {
        let (batch, tickle_me) = scheduler.take_batch(this_thread);
        if tickle_me {
            scheduler.tickle();
        }
        if batch.is_empty() {
            if exit_requested.load(Ordering::Acquire) {
                break;
            }
            if scheduler.stopping() {
                break;
            }
            if let Some(idle) = &idle_fiber {
                if idle.state() != State::Term {
                    let _ = idle.yield_to(true);
                }
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            continue;
        }
        scheduler.0.active_workers.fetch_add(1, Ordering::AcqRel);
        run_batch(&scheduler, batch);
        scheduler.0.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    CURRENT.with(|c| *c.borrow_mut() = None);
}

fn run_batch(scheduler: &Scheduler, batch: Vec<Task>) {
    for task in batch {
        match task.body {
            TaskBody::Fiber(f) => {
                if f.state() != State::Term {
                    if let Err(e) = f.yield_to(true) {
                        fatal(scheduler, &f, e);
                    }
                }
            }
            TaskBody::Callable(callable) => {
                let dispatch = dispatch_fiber();
                dispatch
                    .reset(callable)
                    .expect("dispatch fiber must be Init/Term/Except before reset");
                if let Err(e) = dispatch.yield_to(true) {
                    fatal(scheduler, &dispatch, e);
                }
            }
        }
    }
}

fn fatal(_scheduler: &Scheduler, fiber: &Fiber, e: Error) {
    log::error!("fatal error from task fiber {:?}: {}", fiber.name(), e);
    panic!("unhandled error escaped a scheduler task: {e}");
}

fn register_idle_fiber(scheduler: &Scheduler, this_thread: ThreadId) {
    let mut workers = scheduler.0.workers.lock().unwrap();
    if let Some(slot) = workers.iter_mut().find(|w| w.thread_id == this_thread) {
        let idle_impl_scheduler = scheduler.clone();
        let name = format!("idle-{this_thread:?}");
        slot.idle_fiber = Fiber::new(name, move || loop {
            if idle_impl_scheduler.stopping() {
                return;
            }
            idle_impl_scheduler.0.idle_impl.run(&idle_impl_scheduler);
            // One tick, then back to the worker so it re-scans the queue;
            // `run()` returning doesn't by itself hand control anywhere,
            // this fiber is what's actually suspended on the worker's
            // stack. An `Err` here means a cancellation was injected
            // (`set_thread_count` shrinking the pool), so this idle fiber
            // is done.
            if yield_to().is_err() {
                return;
            }
        })
        .expect("failed to allocate idle fiber stack");
    }
}

/// The hijacked root thread never appears in `workers` (it isn't a
/// spawned worker, and `set_thread_count` never needs to cancel it from
/// the outside), so its idle fiber just lives thread-local instead.
fn root_idle_fiber(scheduler: &Scheduler) -> Fiber {
    ROOT_IDLE_FIBER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(f) = slot.as_ref() {
            return f.clone();
        }
        let idle_impl_scheduler = scheduler.clone();
        let f = Fiber::new("idle-root", move || loop {
            if idle_impl_scheduler.stopping() {
                return;
            }
            idle_impl_scheduler.0.idle_impl.run(&idle_impl_scheduler);
            if yield_to().is_err() {
                return;
            }
        })
        .expect("failed to allocate idle fiber stack");
        *slot = Some(f.clone());
        f
    })
}

fn find_idle_fiber(scheduler: &Scheduler, this_thread: ThreadId) -> Option<Fiber> {
    scheduler
        .0
        .workers
        .lock()
        .unwrap()
        .iter()
        .find(|w| w.thread_id == this_thread)
        .map(|w| w.idle_fiber.clone())
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn dispatch_runs_callable_on_hijacked_thread() {
        let scheduler = Scheduler::new_hijacking(1, 4);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        scheduler.dispatch(move || {
            ran2.store(true, Ordering::Relaxed);
        });
        assert!(ran.load(Ordering::Relaxed));
        scheduler.stop();
    }

    #[test]
    fn spawned_workers_drain_queue_on_stop() {
        let scheduler = Scheduler::new(2, 1);
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            scheduler.schedule(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
        scheduler.stop();
        assert_eq!(count.load(Ordering::Relaxed), 10);
        assert_eq!(scheduler.thread_count(), 0);
    }

    #[test]
    fn set_thread_count_grows_and_shrinks() {
        let scheduler = Scheduler::new(1, 1);
        assert_eq!(scheduler.thread_count(), 1);
        scheduler.set_thread_count(4);
        assert_eq!(scheduler.thread_count(), 4);
        scheduler.set_thread_count(2);
        assert_eq!(scheduler.thread_count(), 2);
        scheduler.stop();
    }

    #[test]
    fn thread_targeted_task_only_runs_on_its_thread() {
        let scheduler = Scheduler::new_hijacking(1, 4);
        let this_thread = thread::current().id();
        let ran_here = Arc::new(AtomicBool::new(false));
        let ran_here2 = Arc::clone(&ran_here);
        scheduler.dispatch(move || {
            assert_eq!(thread::current().id(), this_thread);
            ran_here2.store(true, Ordering::Relaxed);
        });
        assert!(ran_here.load(Ordering::Relaxed));
        scheduler.stop();
    }

    #[test]
    fn switch_to_migrates_a_fiber_to_another_scheduler() {
        let a = Scheduler::new_hijacking(1, 1);
        let b = Scheduler::new(1, 1);
        let landed = Arc::new(AtomicBool::new(false));
        let landed2 = Arc::clone(&landed);
        let b_for_task = b.clone();
        a.dispatch(move || {
            switch_to(&b_for_task, None).unwrap();
            landed2.store(true, Ordering::Relaxed);
        });
        // The migrated fiber finishes on `b`'s worker; give it a moment.
        while !landed.load(Ordering::Relaxed) {
            std::thread::yield_now();
        }
        a.stop();
        b.stop();
    }
}
