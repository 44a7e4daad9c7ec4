//! Crate-wide error handling.
//!
//! Every suspension point in this crate — a fiber `call`/`yield_to`, a
//! sync-primitive `lock`/`wait`, a future `wait` — returns a [`Result`]
//! rather than throwing a native exception, since Rust has none. The two
//! things that can come back out of a suspension point are an injected
//! cancellation ([`Error::Cancelled`]) and a relayed panic from the fiber
//! body that was resumed ([`Error::Panicked`]); `?` is the propagation
//! mechanism a caller uses to observe both, mirroring the "catch at a
//! meaningful cleanup boundary" discipline the fiber model assumes.

use std::sync::Arc;

use crate::fiber::SharedPanic;

/// A specialized [`Result`](std::result::Result) for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure cases a fiber/scheduler operation can report.
///
/// Precondition violations (resuming a fiber in the wrong state,
/// re-entrant-locking a non-recursive mutex, destroying a fiber that's
/// `Exec`, …) are programming errors and are not represented here — they
/// are `assert!`/`debug_assert!`s, per the reference implementation this
/// crate follows.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Raised at the suspension point of a fiber that was
    /// [`inject`](crate::fiber::Fiber::inject)ed with a cancellation, or
    /// that was torn down while [`Hold`](crate::fiber::State::Hold).
    #[error("fiber operation was cancelled")]
    Cancelled,

    /// A user closure running inside a fiber panicked; the payload was
    /// captured by `catch_unwind` at the entry trampoline and is relayed
    /// here to whoever next resumes (or scheduled) that fiber.
    #[error("fiber panicked: {0:?}")]
    Panicked(SharedPanic),

    /// An OS-level failure underneath the scheduler (thread spawn, stack
    /// allocation, …) rather than anything a fiber body did.
    #[error("io error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// `true` for [`Error::Cancelled`] specifically, so cleanup code can
    /// tell "I was cancelled" apart from "the task I awaited panicked"
    /// without a full `match`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
