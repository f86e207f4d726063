//! Process and fork lifecycle.
//!
//! [`Runtime`] ties one [`ProcessState`] to its [`FilterManager`] and daemon.
//! The hooks are ordinary methods; the C entry points in [`crate::ffi`] call
//! them for instrumented binaries, tests call them directly with a fake
//! [`DaemonConnector`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use loom_config::{log_engine_error, log_engine_info, EngineConfig};

use crate::daemon::{DaemonConnector, DaemonHandle};
use crate::error::LifecycleError;
use crate::manager::FilterManager;
use crate::quiescence::Coordinator;
use crate::state::ProcessState;

pub struct Runtime {
    state: Arc<ProcessState>,
    manager: Arc<FilterManager>,
    connector: Box<dyn DaemonConnector>,
    daemon: Mutex<Option<Box<dyn DaemonHandle>>>,
    started: AtomicBool,
}

impl Runtime {
    pub fn new(engine: &EngineConfig, connector: Box<dyn DaemonConnector>) -> Self {
        let state = Arc::new(ProcessState::new(engine));
        let manager = Arc::new(FilterManager::new(
            state.clone(),
            engine.revert_switches_on_remove,
        ));
        Self {
            state,
            manager,
            connector,
            daemon: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    pub fn manager(&self) -> &Arc<FilterManager> {
        &self.manager
    }

    pub fn coordinator(&self) -> &Coordinator {
        self.state.coordinator()
    }

    fn daemon(&self) -> MutexGuard<'_, Option<Box<dyn DaemonHandle>>> {
        self.daemon
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the daemon, then register the calling (initial) thread.
    pub fn on_process_start(&self) -> Result<(), LifecycleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStarted);
        }
        let handle = match self.connector.start(self.manager.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.daemon() = Some(handle);

        self.coordinator().enter_thread();
        log_engine_info!("Process entered", pid = std::process::id());
        Ok(())
    }

    /// Release the calling thread, stop the daemon and check for leaks.
    ///
    /// Filters still installed at this point are leaks. They are reported,
    /// and debug builds abort; nothing is evacuated, since a thread parked in
    /// a blocking call would hold exit up forever.
    pub fn on_process_exit(&self) {
        let leaked = self.shutdown();
        debug_assert!(
            leaked.is_empty(),
            "filters {:?} still installed at exit",
            leaked
        );
    }

    /// The body of [`on_process_exit`](Self::on_process_exit) without the
    /// assertion. Returns the ids of leaked filters.
    pub fn shutdown(&self) -> Vec<u32> {
        self.coordinator().exit_thread(true);
        if let Some(handle) = self.daemon().take() {
            handle.stop();
        }

        let leaked = self.manager.ids();
        for &id in &leaked {
            log_engine_error!("Filter still installed at exit", filter_id = id);
        }
        let operations = self.state.registry().len();
        if operations > 0 {
            log_engine_error!("Operation registry not empty at exit", operations = operations);
        }

        self.started.store(false, Ordering::SeqCst);
        log_engine_info!("Process exited", pid = std::process::id());
        leaked
    }

    /// Rebuild state in a forked child and give it its own daemon.
    ///
    /// Installed filters are inherited. The parent's daemon thread does not
    /// exist in the child, so its handle is forgotten rather than stopped.
    ///
    /// # Safety
    /// Call only in the child right after `fork`, before it spawns threads.
    pub unsafe fn on_forked_child(&self) -> Result<(), LifecycleError> {
        self.coordinator().reinit_after_fork();
        self.manager.reinit_after_fork();

        if let Some(parent_daemon) = self.daemon().take() {
            std::mem::forget(parent_daemon);
        }
        let handle = self.connector.start(self.manager.clone())?;
        *self.daemon() = Some(handle);

        log_engine_info!("Forked child entered", pid = std::process::id());
        Ok(())
    }

    #[inline]
    pub fn dispatch(&self, slot: u32) {
        self.state.dispatch(slot);
    }

    #[inline]
    pub fn is_patched(&self, function: u32) -> bool {
        self.state.is_patched(function)
    }
}
