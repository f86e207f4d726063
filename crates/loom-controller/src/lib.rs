//! # loom-controller
//!
//! The controller every Loom daemon connects to.
//!
//! ## Architecture
//!
//! One controller serves many instrumented processes. It:
//! - Keeps the table of active filters (id → filter file)
//! - Fans each operator `add`/`del` out to every connected daemon
//! - Replays active filters to daemons that connect late
//!
//! ## Communication
//!
//! Daemons and `loomctl` both connect over TCP and open with a handshake:
//! - `iam loom_daemon <pid>`: the connection carries controller → daemon requests
//! - `iam loom_ctl`: the connection carries operator → controller requests
//!
//! Frames are length-prefixed text, see `loom_ipc`.

pub mod commands;
pub mod socket;

use std::sync::Arc;

use anyhow::{Context, Result};
use loom_config::{log_controller_info, Config};
use loom_ipc::ControlCommand;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, MutexGuard};

pub use commands::{ControllerState, DaemonRequest};

/// Shared handle on the controller state.
///
/// The mutex serializes operator commands against each other and against
/// daemons joining, so a late daemon never misses a filter.
#[derive(Debug)]
pub struct Controller {
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(max_filters: u32) -> Self {
        Self {
            state: Mutex::new(ControllerState::new(max_filters)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().await
    }

    pub async fn execute(&self, command: ControlCommand) -> String {
        self.lock().await.execute(command).await
    }
}

/// Main controller entry point: bind the configured address and serve until
/// the listener fails.
pub async fn run_server(config: &Config) -> Result<()> {
    let addr = config.controller.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind controller address {}", addr))?;
    log_controller_info!(
        "Controller listening",
        addr = addr.as_str(),
        max_filters = config.controller.max_filters
    );

    let controller = Arc::new(Controller::new(config.controller.max_filters));
    socket::serve(listener, controller).await
}
