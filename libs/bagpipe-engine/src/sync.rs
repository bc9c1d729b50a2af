use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!(state = std::any::type_name::<T>(), "lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
