//! Poison-tolerant lock helpers.
//!
//! The guard's in-process state (fallback counters, reputation tracker, MCP registry,
//! nonce set) is advisory: after a panic elsewhere it is better to keep serving with
//! possibly stale entries than to take every later request down with the poisoned lock.
//! Each recovery is logged at ERROR level so it shows up in monitoring.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

/// Lock a Mutex, recovering the guard if a previous holder panicked.
///
/// `context` names the protected state in the log line.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("Mutex poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}

/// Read-lock a RwLock, recovering from poisoning.
pub fn read_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    rwlock.read().unwrap_or_else(|poisoned| {
        error!("RwLock (read) poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}

/// Write-lock a RwLock, recovering from poisoning.
pub fn write_lock_or_recover<'a, T>(
    rwlock: &'a RwLock<T>,
    context: &str,
) -> RwLockWriteGuard<'a, T> {
    rwlock.write().unwrap_or_else(|poisoned| {
        error!("RwLock (write) poisoned for '{}' - continuing with recovered state", context);
        poisoned.into_inner()
    })
}
