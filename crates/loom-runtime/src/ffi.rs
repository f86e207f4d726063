//! C entry points called by instrumented binaries.
//!
//! The only process-global in the engine is the [`Runtime`] behind these
//! functions. Before `loom_enter_process` runs, every hook is a no-op.

use std::sync::OnceLock;

use loom_config::log_engine_error;
use loom_config::logging::{try_init_logging, LogLevel};

use crate::daemon::TcpConnector;
use crate::error::LifecycleError;
use crate::lifecycle::Runtime;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

#[inline(always)]
fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

extern "C" fn exit_hook() {
    if let Some(rt) = runtime() {
        rt.on_process_exit();
    }
}

/// Initialize the engine for this process. Aborts if the daemon cannot be
/// started.
#[no_mangle]
pub extern "C" fn loom_enter_process() {
    if std::env::var_os("LOOM_LOG").is_some() {
        try_init_logging(LogLevel::Warn);
    }

    let rt = RUNTIME.get_or_init(|| {
        let config = loom_config::config().clone();
        Runtime::new(&config.engine, Box::new(TcpConnector::new(&config)))
    });
    match rt.on_process_start() {
        Ok(()) => {}
        Err(LifecycleError::AlreadyStarted) => return,
        Err(e) => {
            log_engine_error!("Cannot start the loom daemon, aborting", error = e.to_string());
            eprintln!("loom: {}", e);
            std::process::abort();
        }
    }
    unsafe {
        libc::atexit(exit_hook);
    }
}

/// Call in the child right after `fork`.
#[no_mangle]
pub extern "C" fn loom_enter_forked_process() {
    if let Some(rt) = runtime() {
        if let Err(e) = unsafe { rt.on_forked_child() } {
            log_engine_error!("Cannot start the loom daemon in child, aborting", error = e.to_string());
            eprintln!("loom: {}", e);
            std::process::abort();
        }
    }
}

#[no_mangle]
pub extern "C" fn loom_exit_process() {
    exit_hook();
}

#[no_mangle]
pub extern "C" fn loom_enter_thread() {
    if let Some(rt) = runtime() {
        rt.coordinator().enter_thread();
    }
}

#[no_mangle]
pub extern "C" fn loom_exit_thread() {
    if let Some(rt) = runtime() {
        rt.coordinator().exit_thread(false);
    }
}

#[no_mangle]
pub extern "C" fn loom_cycle_check(back_edge: u32) {
    if let Some(rt) = runtime() {
        rt.coordinator().cycle_check(back_edge);
    }
}

#[no_mangle]
pub extern "C" fn loom_before_blocking(call_site: u32) {
    if let Some(rt) = runtime() {
        rt.coordinator().before_blocking(call_site);
    }
}

#[no_mangle]
pub extern "C" fn loom_after_blocking(call_site: u32) {
    if let Some(rt) = runtime() {
        rt.coordinator().after_blocking(call_site);
    }
}

#[no_mangle]
pub extern "C" fn loom_slot(slot: u32) {
    if let Some(rt) = runtime() {
        rt.dispatch(slot);
    }
}

/// Returns 1 when the patched clone of `function` should run.
#[no_mangle]
pub extern "C" fn loom_switch(function: u32) -> libc::c_int {
    match runtime() {
        Some(rt) if rt.is_patched(function) => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global runtime is never initialized in unit tests
    #[test]
    fn test_hooks_are_inert_before_start() {
        loom_enter_thread();
        loom_cycle_check(0);
        loom_before_blocking(0);
        loom_after_blocking(0);
        loom_slot(0);
        assert_eq!(loom_switch(0), 0);
        loom_exit_thread();
        loom_enter_forked_process();
        loom_exit_process();
    }
}
