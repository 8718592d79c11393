mod backlog;
mod logging;

pub use backlog::Backlog;
pub use logging::{level_for, setup_logging};

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::error;

/// Pause after a failed accept, e.g. when out of file descriptors
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lock a std mutex, taking the guard back from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log a failed accept and wait before the next attempt.
pub(crate) async fn back_off_accept(what: &str, err: &io::Error) {
    error!("Failed to accept {}: {}", what, err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
