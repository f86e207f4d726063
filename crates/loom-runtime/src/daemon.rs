//! The in-process daemon.
//!
//! A background thread that keeps a connection to the controller and applies
//! the controller's `add`/`del`/`ls` commands to the local [`FilterManager`].
//! It is never registered with the coordinator: it is the updater.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use loom_config::{log_daemon_debug, log_daemon_error, log_daemon_info, log_daemon_warn, Config};
use loom_ipc::{read_frame, write_frame, DaemonCommand, Hello, IpcError, OK};

use crate::error::LifecycleError;
use crate::manager::{FilterManager, FilterSummary};

/// Starts the daemon for a process. Lifecycle tests substitute their own.
pub trait DaemonConnector: Send + Sync {
    fn start(&self, manager: Arc<FilterManager>) -> Result<Box<dyn DaemonHandle>, LifecycleError>;
}

/// A running daemon.
pub trait DaemonHandle: Send {
    /// Stop the daemon and wait for it to finish.
    fn stop(self: Box<Self>);
}

/// Apply one controller command and produce the reply line.
pub fn handle_command(manager: &FilterManager, line: &str) -> String {
    let command = match line.parse::<DaemonCommand>() {
        Ok(command) => command,
        Err(e) => return e.to_string(),
    };
    log_daemon_debug!("Command received", command = line);

    match command {
        DaemonCommand::Add { id, path } => match manager.install_file(id, &path) {
            Ok(()) => OK.to_string(),
            Err(e) => {
                tracing::warn!(component = "DAEMON", filter_id = id, error = %e, "Add failed");
                format!("failed to add the filter: {}", e)
            }
        },
        DaemonCommand::Del { id } => match manager.remove(id) {
            Ok(()) => OK.to_string(),
            Err(e) => {
                tracing::warn!(component = "DAEMON", filter_id = id, error = %e, "Delete failed");
                format!("failed to delete the filter: {}", e)
            }
        },
        DaemonCommand::Ls => format_listing(&manager.list()),
    }
}

/// `ID\ttype\tops\tfuncs` table.
pub fn format_listing(rows: &[FilterSummary]) -> String {
    let mut out = String::from("ID\ttype\tops\tfuncs");
    for row in rows {
        out.push_str(&format!(
            "\n{}\t{}\t{}\t{}",
            row.id, row.kind, row.ops, row.functions
        ));
    }
    out
}

#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

impl StopSignal {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_stream(&self, stream: Option<TcpStream>) {
        *self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = stream;
    }

    fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let guard = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(stream) = guard.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Sleep for `total`, waking early on stop.
    fn sleep(&self, total: Duration) {
        const STEP: Duration = Duration::from_millis(20);
        let mut left = total;
        while !left.is_zero() && !self.is_stopped() {
            let step = left.min(STEP);
            std::thread::sleep(step);
            left -= step;
        }
    }
}

/// Connects to the controller over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
}

impl TcpConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            addr: config.controller.addr(),
            reconnect_interval: Duration::from_millis(config.daemon.reconnect_interval_ms),
            max_reconnect_attempts: config.daemon.max_reconnect_attempts,
        }
    }
}

impl DaemonConnector for TcpConnector {
    fn start(&self, manager: Arc<FilterManager>) -> Result<Box<dyn DaemonHandle>, LifecycleError> {
        let signal = Arc::new(StopSignal::default());
        let worker = DaemonWorker {
            connector: self.clone(),
            manager,
            signal: signal.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("loom-daemon".into())
            .spawn(move || worker.run())
            .map_err(LifecycleError::DaemonStart)?;

        Ok(Box::new(TcpDaemon {
            signal,
            thread: Some(thread),
        }))
    }
}

struct TcpDaemon {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl DaemonHandle for TcpDaemon {
    fn stop(mut self: Box<Self>) {
        self.signal.trigger();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

struct DaemonWorker {
    connector: TcpConnector,
    manager: Arc<FilterManager>,
    signal: Arc<StopSignal>,
}

impl DaemonWorker {
    fn run(self) {
        // The host application may route signals to a dedicated thread
        // (sigwait); this thread must never take them.
        if let Err(e) = block_all_signals() {
            log_daemon_warn!("Failed to block signals", error = e.to_string());
        }

        let pid = std::process::id();
        let mut failures = 0u32;
        while !self.signal.is_stopped() {
            match TcpStream::connect(&self.connector.addr) {
                Ok(stream) => {
                    failures = 0;
                    log_daemon_info!(
                        "Connected to controller",
                        addr = self.connector.addr.as_str(),
                        pid = pid
                    );
                    self.signal.set_stream(stream.try_clone().ok());
                    if self.signal.is_stopped() {
                        break;
                    }
                    match self.serve(stream, pid) {
                        Ok(()) => log_daemon_info!("Controller closed the connection"),
                        Err(e) if !self.signal.is_stopped() => {
                            log_daemon_warn!("Controller connection lost", error = e.to_string())
                        }
                        Err(_) => {}
                    }
                    self.signal.set_stream(None);
                }
                Err(e) => {
                    failures += 1;
                    log_daemon_debug!(
                        "Controller not reachable",
                        addr = self.connector.addr.as_str(),
                        error = e.to_string()
                    );
                    let limit = self.connector.max_reconnect_attempts;
                    if limit != 0 && failures >= limit {
                        log_daemon_error!("Giving up on controller", attempts = failures);
                        return;
                    }
                }
            }
            self.signal.sleep(self.connector.reconnect_interval);
        }
        log_daemon_debug!("Daemon stopped");
    }

    fn serve(&self, mut stream: TcpStream, pid: u32) -> Result<(), IpcError> {
        write_frame(&mut stream, &Hello::Daemon { pid }.to_string())?;
        while let Some(line) = read_frame(&mut stream)? {
            let reply = handle_command(&self.manager, &line);
            write_frame(&mut stream, &reply)?;
        }
        Ok(())
    }
}

fn block_all_signals() -> io::Result<()> {
    use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None)
        .map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessState;
    use loom_config::EngineConfig;

    fn manager() -> FilterManager {
        let engine = EngineConfig {
            max_slots: 64,
            max_back_edges: 8,
            max_call_sites: 8,
            max_functions: 8,
            revert_switches_on_remove: true,
        };
        FilterManager::new(Arc::new(ProcessState::new(&engine)), true)
    }

    #[test]
    fn test_add_del_ls() {
        let m = manager();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cs.filter");
        std::fs::write(&path, "1 2 0 4 1 5 1 2").unwrap();

        assert_eq!(handle_command(&m, &format!("add 3 {}", path.display())), "OK");
        assert_eq!(handle_command(&m, "ls"), "ID\ttype\tops\tfuncs\n3\tcritical_region\t2\t1");

        let dup = handle_command(&m, &format!("add 3 {}", path.display()));
        assert!(dup.starts_with("failed to add the filter"), "{}", dup);

        assert_eq!(handle_command(&m, "del 3"), "OK");
        assert!(handle_command(&m, "del 3").starts_with("failed to delete the filter"));
        assert_eq!(handle_command(&m, "ls"), "ID\ttype\tops\tfuncs");
    }

    #[test]
    fn test_bad_commands() {
        let m = manager();
        assert_eq!(handle_command(&m, ""), "no command specified");
        assert_eq!(
            handle_command(&m, "add 1"),
            "format error: add <filter ID> <file name>"
        );
        assert!(handle_command(&m, "launch").starts_with("unknown command"));
        assert!(handle_command(&m, "add 1 /no/such/file").contains("cannot read filter file"));
    }
}
