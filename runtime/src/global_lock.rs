//! The coarse-grained global lock (spec.md §5 "Global lock") that protects
//! all peer/download/chunk-list state touched from more than one thread.
//! Grounded on `thread_base::global_lock_type` and its
//! `acquire_global_lock`/`release_global_lock`/`waive_global_lock`/
//! `entering_main_polling`/`leaving_main_polling` free functions, folded
//! into one process-wide singleton since the original keeps exactly one
//! instance (`thread_base::m_global`) shared by every thread subclass.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};

struct GlobalLock {
    mutex: Mutex<()>,
    waiting: AtomicUsize,
    main_polling: AtomicBool,
}

fn global() -> &'static GlobalLock {
    static LOCK: OnceLock<GlobalLock> = OnceLock::new();
    LOCK.get_or_init(|| GlobalLock { mutex: Mutex::new(()), waiting: AtomicUsize::new(0), main_polling: AtomicBool::new(false) })
}

/// RAII guard for the global lock; dropping it releases the lock.
pub struct GlobalLockGuard(MutexGuard<'static, ()>);

/// Number of threads currently blocked waiting to acquire the global lock.
pub fn waiting_count() -> usize {
    global().waiting.load(Ordering::SeqCst)
}

pub fn acquire() -> GlobalLockGuard {
    let g = global();
    g.waiting.fetch_add(1, Ordering::SeqCst);
    let guard = g.mutex.lock();
    g.waiting.fetch_sub(1, Ordering::SeqCst);
    GlobalLockGuard(guard)
}

pub fn try_acquire() -> Option<GlobalLockGuard> {
    global().mutex.try_lock().map(GlobalLockGuard)
}

/// Release `guard` then immediately reacquire the lock, giving any waiter
/// a chance to run first (`thread_base::waive_global_lock`).
pub fn waive(guard: GlobalLockGuard) -> GlobalLockGuard {
    drop(guard);
    acquire()
}

pub fn is_main_polling() -> bool {
    global().main_polling.load(Ordering::SeqCst)
}

/// Marks the main thread as currently inside its poll call; other threads
/// must not touch the main thread's poll registrations while this is set.
pub fn entering_main_polling() {
    global().main_polling.store(true, Ordering::SeqCst);
}

pub fn leaving_main_polling() {
    global().main_polling.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_acquire_release_round_trip() {
        let guard = acquire();
        drop(guard);
        assert!(try_acquire().is_some());
    }

    #[test]
    fn positive_main_polling_flag_toggles() {
        assert!(!is_main_polling());
        entering_main_polling();
        assert!(is_main_polling());
        leaving_main_polling();
        assert!(!is_main_polling());
    }
}
