pub mod backoff;
pub mod fork_mutex;
pub mod region;
pub mod update_lock;

pub use backoff::Backoff;
pub use fork_mutex::{ForkSafeMutex, ForkSafeMutexGuard};
pub use region::{RegionLock, Semaphore};
pub use update_lock::UpdateLock;
