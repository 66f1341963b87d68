use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// The registries and channel states stay structurally consistent across
/// panics (every mutation is completed before the guard drops), so a
/// poisoned lock carries no extra meaning for us.
#[inline]
pub(crate) fn plock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
