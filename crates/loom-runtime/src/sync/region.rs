//! Synchronization objects that filters inject at slots.
//!
//! A filter's start and end operations run as two independent callbacks, so
//! nothing can carry a guard from one to the other. These objects expose
//! explicit acquire/release pairs instead.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Non-reentrant lock guarding a critical region, owned by the thread that
/// acquired it.
#[derive(Debug, Default)]
pub struct RegionLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl RegionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) {
        let mut owner = lock(&self.owner);
        while owner.is_some() {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *owner = Some(thread::current().id());
    }

    /// Release the region.
    ///
    /// A thread that was already past the start slot when the filter went in
    /// reaches the end slot without holding the region. Its release is
    /// ignored, whether the region is free or owned by another thread.
    pub fn release(&self) {
        let mut owner = lock(&self.owner);
        if *owner != Some(thread::current().id()) {
            tracing::debug!(held = owner.is_some(), "Region released by a thread not holding it");
            return;
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
    }

    pub fn is_held(&self) -> bool {
        lock(&self.owner).is_some()
    }
}

/// Counting semaphore, starting at zero.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn up(&self) {
        *lock(&self.permits) += 1;
        self.available.notify_one();
    }

    pub fn down(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *permits -= 1;
    }

    pub fn permits(&self) -> usize {
        *lock(&self.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_region_lock_excludes() {
        let region = Arc::new(RegionLock::new());
        region.acquire();

        let entered = Arc::new(AtomicBool::new(false));
        let (r2, e2) = (region.clone(), entered.clone());
        let t = std::thread::spawn(move || {
            r2.acquire();
            e2.store(true, Ordering::SeqCst);
            r2.release();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        region.release();
        t.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!region.is_held());
    }

    #[test]
    fn test_unmatched_release_is_ignored() {
        let region = RegionLock::new();
        region.release();
        assert!(!region.is_held());
        region.acquire();
        assert!(region.is_held());
    }

    #[test]
    fn test_release_from_other_thread_is_ignored() {
        let region = Arc::new(RegionLock::new());
        let (acquired_tx, acquired_rx) = std::sync::mpsc::channel();
        let (leave_tx, leave_rx) = std::sync::mpsc::channel::<()>();

        let r2 = region.clone();
        let owner = std::thread::spawn(move || {
            r2.acquire();
            acquired_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
            r2.release();
        });
        acquired_rx.recv().unwrap();

        // A thread that never acquired reaches the end slot
        region.release();
        assert!(region.is_held());

        let entered = Arc::new(AtomicBool::new(false));
        let (r3, e3) = (region.clone(), entered.clone());
        let third = std::thread::spawn(move || {
            r3.acquire();
            e3.store(true, Ordering::SeqCst);
            r3.release();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        leave_tx.send(()).unwrap();
        owner.join().unwrap();
        third.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!region.is_held());
    }

    #[test]
    fn test_semaphore_orders_threads() {
        let sem = Arc::new(Semaphore::new());
        let s2 = sem.clone();
        let waiter = std::thread::spawn(move || s2.down());

        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        sem.up();
        waiter.join().unwrap();
        assert_eq!(sem.permits(), 0);
    }
}
