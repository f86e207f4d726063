use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use super::Backoff;

/// A mutex that a forked child can reset.
///
/// A `std::sync::Mutex` held by some parent thread at `fork` stays locked
/// forever in the child, where that thread does not exist. This one is a
/// single flag that [`reset_after_fork`](Self::reset_after_fork) clears.
/// Waiters back off instead of parking; hold times are an update at most.
pub struct ForkSafeMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ForkSafeMutex<T> {}
unsafe impl<T: Send> Sync for ForkSafeMutex<T> {}

impl<T> ForkSafeMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> ForkSafeMutexGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        ForkSafeMutexGuard { mutex: self }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Drop a hold left behind by a parent thread.
    ///
    /// # Safety
    /// Only sound in a freshly forked child before it spawns threads. The
    /// data must not have been mid-write in the parent at the fork.
    pub unsafe fn reset_after_fork(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct ForkSafeMutexGuard<'a, T> {
    mutex: &'a ForkSafeMutex<T>,
}

impl<T> Deref for ForkSafeMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ForkSafeMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ForkSafeMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mutual_exclusion() {
        let m = Arc::new(ForkSafeMutex::new(0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }

    #[test]
    fn test_reset_releases_orphaned_hold() {
        let m = ForkSafeMutex::new(vec![1, 2]);
        std::mem::forget(m.lock());
        assert!(m.is_locked());

        unsafe { m.reset_after_fork() };
        m.lock().push(3);
        assert_eq!(*m.lock(), vec![1, 2, 3]);
    }
}
