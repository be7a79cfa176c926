use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks `lock`, carrying on with the inner state if a holder panicked.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            target = "ondata::cache::lock",
            owner = target,
            op,
            "recovered poisoned mutex; blob state may reflect a half-applied update"
        );
        poisoned.into_inner()
    })
}
