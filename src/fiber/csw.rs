//! Context switches tracking utilities.
//!
//! Those are mostly used for testing.

use crate::fiber;

/// Returns the number of context switches the calling fiber has been
/// through (i.e. how many times it has yielded and been resumed).
pub fn csw() -> u64 {
    fiber::with_current(|f| f.switch_count())
}

/// Calls a function and checks whether it yielded.
///
/// # Example
///
/// ```no_run
/// # use fibercore::fiber;
/// # use fibercore::fiber::YieldResult::*;
/// assert_eq!(
///     fiber::check_yield(|| ()),
///     DidntYield(())
/// );
/// assert_eq!(
///     fiber::check_yield(|| fiber::yield_now().unwrap()),
///     Yielded(())
/// );
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = csw();
    let res = f();
    if csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::YieldResult;
    use crate::fiber;
    use crate::scheduler::Scheduler;

    #[test]
    fn check_yield() {
        let scheduler = Scheduler::new_hijacking(1, 1);
        scheduler.dispatch(|| {
            assert_eq!(
                super::check_yield(|| ()), //
                YieldResult::DidntYield(())
            );
            assert_eq!(
                super::check_yield(|| fiber::yield_now().unwrap()),
                YieldResult::Yielded(())
            );
        });
    }
}
