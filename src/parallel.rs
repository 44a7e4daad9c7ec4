//! Parallel combinators built on top of [`crate::scheduler`] and
//! [`crate::sync`]: fan a batch of closures or a range of items out over
//! fibers, then collect.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, SharedPanic};
use crate::scheduler;
use crate::sync::FiberSemaphore;

/// Runs every closure in `fns` to completion, at most `parallelism` of
/// them concurrently (`None` for unlimited), and re-raises the first
/// captured panic if any occurred.
///
/// Falls back to running `fns` sequentially on the calling fiber if there
/// is no active scheduler on this thread, or if there's nothing to
/// parallelize (`fns.len() <= 1`).
pub fn parallel_do<F>(fns: Vec<F>, parallelism: Option<usize>) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    if scheduler::current().is_none() || fns.len() <= 1 {
        for f in fns {
            run_catching(f)?;
        }
        return Ok(());
    }

    let scheduler = scheduler::current().unwrap();
    let total = fns.len();
    let semaphore = parallelism.map(|n| Arc::new(FiberSemaphore::new(n)));
    let remaining = Arc::new(AtomicUsize::new(total));
    let first_error: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
    let coordinator_fiber =
        fiber::current().expect("parallel_do must be called from a running fiber");

    for f in fns {
        let semaphore = semaphore.clone();
        let remaining = Arc::clone(&remaining);
        let first_error = Arc::clone(&first_error);
        let coordinator = scheduler.clone();
        let coordinator_fiber = coordinator_fiber.clone();
        let worker = Fiber::new("parallel_do-worker", move || {
            if let Some(sem) = &semaphore {
                let _ = sem.wait();
            }
            if let Err(e) = run_catching(f) {
                let mut slot = first_error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            if let Some(sem) = &semaphore {
                sem.notify();
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                coordinator.schedule_fiber(coordinator_fiber);
            }
        })?;
        scheduler.schedule_fiber(worker);
    }

    scheduler::yield_to()?;

    match first_error.lock().unwrap().take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Like [`parallel_do`], but reuses a caller-supplied vector of fibers
/// instead of spawning fresh ones.
///
/// `fibers` must have at least `fns.len()` entries; only its first
/// `fns.len()` are reset and scheduled, one per functor, matched up by
/// index. Falls back to running `fns` sequentially on the calling fiber
/// under the same conditions as [`parallel_do`] (no active scheduler, or
/// `fns.len() <= 1`) — the reused fibers are left untouched in that case.
///
/// Since the fibers are borrowed rather than owned by this call, the
/// caller is free to reuse them again the moment it returns; to be safe
/// from another thread still resuming one of them past the single
/// `yield_to`, this busy-yields until every reused fiber has actually
/// left [`crate::fiber::State::Exec`] before returning.
///
/// # Panics
///
/// Panics if `fibers.len() < fns.len()`.
pub fn parallel_do_reusing<F>(fibers: &[Fiber], fns: Vec<F>, parallelism: Option<usize>) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    assert!(
        fibers.len() >= fns.len(),
        "parallel_do_reusing: not enough fibers ({}) for {} functors",
        fibers.len(),
        fns.len()
    );

    if scheduler::current().is_none() || fns.len() <= 1 {
        for f in fns {
            run_catching(f)?;
        }
        return Ok(());
    }

    let scheduler = scheduler::current().unwrap();
    let total = fns.len();
    let semaphore = parallelism.map(|n| Arc::new(FiberSemaphore::new(n)));
    let remaining = Arc::new(AtomicUsize::new(total));
    let first_error: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
    let coordinator_fiber =
        fiber::current().expect("parallel_do_reusing must be called from a running fiber");

    let reused = &fibers[..total];
    for (fiber, f) in reused.iter().zip(fns) {
        let semaphore = semaphore.clone();
        let remaining = Arc::clone(&remaining);
        let first_error = Arc::clone(&first_error);
        let coordinator = scheduler.clone();
        let coordinator_fiber = coordinator_fiber.clone();
        fiber
            .reset(move || {
                if let Some(sem) = &semaphore {
                    let _ = sem.wait();
                }
                if let Err(e) = run_catching(f) {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
                if let Some(sem) = &semaphore {
                    sem.notify();
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    coordinator.schedule_fiber(coordinator_fiber);
                }
            })
            .expect("reused fiber must be Init/Term/Except before reset");
        scheduler.schedule_fiber(fiber.clone());
    }

    scheduler::yield_to()?;

    // The coordinator schedule above fires as soon as the last worker
    // decrements `remaining`, which happens before that worker's fiber
    // has actually returned to the scheduler and settled into `Term` —
    // some other thread's dispatch loop may still be unwinding its stack
    // at this exact moment. Spin until every reused fiber has left EXEC
    // so the caller can safely reset or free them the instant this
    // returns.
    loop {
        if reused.iter().all(|f| f.state() != fiber::State::Exec) {
            break;
        }
        scheduler::yield_now()?;
    }

    match first_error.lock().unwrap().take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Applies `f` to every item from `items`, running up to `parallelism`
/// (default 4) concurrently. Returns `Ok(false)` as soon as any
/// invocation returns `false` — already-dispatched workers are still
/// drained before returning — and re-raises the first captured panic.
///
/// Falls back to running sequentially on the calling fiber if there is no
/// active scheduler on this thread.
pub fn parallel_foreach<T, F>(
    items: impl IntoIterator<Item = T>,
    f: F,
    parallelism: Option<usize>,
) -> Result<bool>
where
    T: Send + 'static,
    F: Fn(T) -> bool + Send + Sync + 'static,
{
    let f = Arc::new(f);

    if scheduler::current().is_none() {
        for item in items {
            if !run_catching_foreach(&f, item)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let parallelism = parallelism.unwrap_or(4).max(1);
    let queue: Arc<StdMutex<VecDeque<T>>> = Arc::new(StdMutex::new(items.into_iter().collect()));
    let scheduler = scheduler::current().unwrap();
    let coordinator_fiber =
        fiber::current().expect("parallel_foreach must be called from a running fiber");

    let all_true = Arc::new(AtomicBool::new(true));
    let stop = Arc::new(AtomicBool::new(false));
    let first_error: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));
    let remaining = Arc::new(AtomicUsize::new(parallelism));

    for _ in 0..parallelism {
        let queue = Arc::clone(&queue);
        let f = Arc::clone(&f);
        let all_true = Arc::clone(&all_true);
        let stop = Arc::clone(&stop);
        let first_error = Arc::clone(&first_error);
        let remaining = Arc::clone(&remaining);
        let coordinator = scheduler.clone();
        let coordinator_fiber = coordinator_fiber.clone();
        let worker = Fiber::new("parallel_foreach-worker", move || {
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let item = queue.lock().unwrap().pop_front();
                let Some(item) = item else { break };
                match run_catching_foreach(&f, item) {
                    Ok(true) => {}
                    Ok(false) => {
                        all_true.store(false, Ordering::Release);
                        stop.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        stop.store(true, Ordering::Release);
                        break;
                    }
                }
                // Give other queued fibers a turn between items, the same
                // way the reference implementation's slot-handoff does.
                let _ = scheduler::yield_now();
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                coordinator.schedule_fiber(coordinator_fiber);
            }
        })?;
        scheduler.schedule_fiber(worker);
    }

    scheduler::yield_to()?;

    if let Some(e) = first_error.lock().unwrap().take() {
        return Err(e);
    }
    Ok(all_true.load(Ordering::Acquire))
}

fn run_catching<F: FnOnce()>(f: F) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Ok(()),
        Err(payload) => Err(Error::Panicked(SharedPanic(Arc::new(payload)))),
    }
}

fn run_catching_foreach<T, F: Fn(T) -> bool>(f: &F, item: T) -> Result<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| f(item))) {
        Ok(b) => Ok(b),
        Err(payload) => Err(Error::Panicked(SharedPanic(Arc::new(payload)))),
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn parallel_do_runs_every_closure() {
        let scheduler = Scheduler::new_hijacking(2, 1);
        let count = Arc::new(AtomicU32::new(0));
        scheduler.dispatch({
            let count = Arc::clone(&count);
            move || {
                let fns: Vec<Box<dyn FnOnce() + Send>> = (0..5)
                    .map(|_| {
                        let count = Arc::clone(&count);
                        Box::new(move || {
                            count.fetch_add(1, Ordering::Relaxed);
                        }) as Box<dyn FnOnce() + Send>
                    })
                    .collect();
                parallel_do(fns, None).unwrap();
            }
        });
        scheduler.stop();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn parallel_do_reusing_runs_every_functor_and_leaves_fibers_reusable() {
        let scheduler = Scheduler::new_hijacking(2, 1);
        let count = Arc::new(AtomicU32::new(0));
        let fibers: Vec<Fiber> = (0..3).map(|i| Fiber::new(format!("reused-{i}"), || {}).unwrap()).collect();
        scheduler.dispatch({
            let count = Arc::clone(&count);
            move || {
                let fns: Vec<Box<dyn FnOnce() + Send>> = (0..3)
                    .map(|_| {
                        let count = Arc::clone(&count);
                        Box::new(move || {
                            count.fetch_add(1, Ordering::Relaxed);
                        }) as Box<dyn FnOnce() + Send>
                    })
                    .collect();
                parallel_do_reusing(&fibers, fns, None).unwrap();
                for f in &fibers {
                    assert_eq!(f.state(), crate::fiber::State::Term);
                }
                // The same fibers can immediately be handed another round.
                let fns2: Vec<Box<dyn FnOnce() + Send>> = (0..3)
                    .map(|_| {
                        let count = Arc::clone(&count);
                        Box::new(move || {
                            count.fetch_add(1, Ordering::Relaxed);
                        }) as Box<dyn FnOnce() + Send>
                    })
                    .collect();
                parallel_do_reusing(&fibers, fns2, None).unwrap();
            }
        });
        scheduler.stop();
        assert_eq!(count.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn parallel_do_sequential_without_scheduler() {
        let count = Arc::new(AtomicU32::new(0));
        let fns: Vec<Box<dyn FnOnce() + Send>> = (0..3)
            .map(|_| {
                let count = Arc::clone(&count);
                Box::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();
        parallel_do(fns, None).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn parallel_foreach_stops_on_first_false() {
        let scheduler = Scheduler::new_hijacking(2, 1);
        let seen = Arc::new(AtomicU32::new(0));
        let result: Arc<StdMutex<Option<bool>>> = Arc::new(StdMutex::new(None));
        scheduler.dispatch({
            let seen = Arc::clone(&seen);
            let result = Arc::clone(&result);
            move || {
                let ok = parallel_foreach(
                    0..20,
                    move |i: u32| {
                        seen.fetch_add(1, Ordering::Relaxed);
                        i < 10
                    },
                    Some(4),
                )
                .unwrap();
                *result.lock().unwrap() = Some(ok);
            }
        });
        scheduler.stop();
        assert!(!result.lock().unwrap().unwrap());
    }

    #[test]
    fn parallel_foreach_all_true_without_scheduler() {
        let seen = Arc::new(AtomicU32::new(0));
        let ok = parallel_foreach(
            0..10,
            {
                let seen = Arc::clone(&seen);
                move |_: u32| {
                    seen.fetch_add(1, Ordering::Relaxed);
                    true
                }
            },
            Some(3),
        )
        .unwrap();
        assert!(ok);
        assert_eq!(seen.load(Ordering::Relaxed), 10);
    }
}
