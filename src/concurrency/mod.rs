//! Async scheduling primitives shared by the SMTP layer.
//!
//! - [`ConcurrencyQueue`]: per-key FIFO lanes running at most N tasks each.
//! - [`SingleFlight`] / [`CallableOnce`]: collapse concurrent identical calls
//!   into one in-flight future.

mod flight;
mod queue;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use flight::{CallableOnce, Flight, SingleFlight};
pub use queue::ConcurrencyQueue;

/// Guards here are never held across an `.await`, so a poisoned lock only
/// means a panic elsewhere; the map itself is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
