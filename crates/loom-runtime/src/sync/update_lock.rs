use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// The process-wide reader/writer lock, on raw pthread primitives.
///
/// Instrumented threads hold it shared while they run; the updater takes it
/// exclusively. A std `RwLock` cannot express this: holds are taken and
/// released by separate hook calls with no guard living in between, and the
/// lock must be re-initialized in place in a forked child.
///
/// Every unlock must happen on the thread that took the hold.
pub struct UpdateLock {
    inner: UnsafeCell<libc::pthread_rwlock_t>,
    readers: AtomicU32,
    writer: AtomicBool,
}

unsafe impl Send for UpdateLock {}
unsafe impl Sync for UpdateLock {}

impl UpdateLock {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER),
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
        }
    }

    pub fn read_lock(&self) {
        let rc = unsafe { libc::pthread_rwlock_rdlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_rdlock failed");
        self.readers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_unlock(&self) {
        self.readers.fetch_sub(1, Ordering::Relaxed);
        let rc = unsafe { libc::pthread_rwlock_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock (shared) failed");
    }

    pub fn write_lock(&self) {
        let rc = unsafe { libc::pthread_rwlock_wrlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_wrlock failed");
        self.writer.store(true, Ordering::Relaxed);
    }

    pub fn write_unlock(&self) {
        self.writer.store(false, Ordering::Relaxed);
        let rc = unsafe { libc::pthread_rwlock_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock (exclusive) failed");
    }

    /// Number of shared holds currently outstanding. Diagnostic only.
    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Relaxed)
    }

    /// Whether some thread holds the lock exclusively. Diagnostic only.
    pub fn is_write_locked(&self) -> bool {
        self.writer.load(Ordering::Relaxed)
    }

    /// Reset to the unlocked state.
    ///
    /// # Safety
    /// Only sound in a freshly forked child, where every thread that held the
    /// lock in the parent is gone and the caller is the only thread.
    pub unsafe fn reinit(&self) {
        std::ptr::write(self.inner.get(), libc::PTHREAD_RWLOCK_INITIALIZER);
        self.readers.store(0, Ordering::Relaxed);
        self.writer.store(false, Ordering::Relaxed);
    }
}

impl Default for UpdateLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_rwlock_destroy(self.inner.get());
        }
    }
}
