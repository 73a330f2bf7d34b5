//! Type aliases for shared state crossing the I/O thread boundary.
//!
//! The protocol engine runs on its own thread while callers submit work from
//! others; these aliases name the `parking_lot`-guarded containers they share.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// Shared value behind a mutex (simulator machine, transport handles)
pub type ThreadSafe<T> = Arc<Mutex<T>>;

/// Shared FIFO, e.g. the control mailbox drained by the I/O thread
pub type ThreadSafeDeque<T> = Arc<Mutex<VecDeque<T>>>;

/// Shared value read far more often than written (run settings)
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

#[inline]
pub fn thread_safe<T>(value: T) -> ThreadSafe<T> {
    Arc::new(Mutex::new(value))
}

#[inline]
pub fn thread_safe_deque<T>() -> ThreadSafeDeque<T> {
    Arc::new(Mutex::new(VecDeque::new()))
}

#[inline]
pub fn thread_safe_rw<T>(value: T) -> ThreadSafeRw<T> {
    Arc::new(RwLock::new(value))
}
