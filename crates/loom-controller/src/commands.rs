//! Command handlers for the controller

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use loom_config::{log_controller_info, log_controller_warn};
use loom_ipc::{is_ok, ControlCommand, DaemonCommand, OK};
use tokio::sync::{mpsc, oneshot};

/// One request for a daemon connection task, with the slot for its reply.
#[derive(Debug)]
pub struct DaemonRequest {
    pub command: DaemonCommand,
    pub reply: oneshot::Sender<String>,
}

/// A connected daemon, as seen from the command side.
#[derive(Debug)]
struct DaemonLink {
    conn: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<DaemonRequest>,
}

impl DaemonLink {
    /// Returns `None` when the daemon's connection is gone.
    async fn ask(&self, command: DaemonCommand) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DaemonRequest { command, reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Filter-id table and daemon registry.
///
/// Every method that talks to daemons runs to completion before the next
/// command is looked at; callers serialize through [`crate::Controller`].
#[derive(Debug)]
pub struct ControllerState {
    max_filters: u32,
    filters: BTreeMap<u32, PathBuf>,
    daemons: BTreeMap<u32, DaemonLink>,
    next_conn: u64,
}

impl ControllerState {
    pub fn new(max_filters: u32) -> Self {
        Self {
            max_filters,
            filters: BTreeMap::new(),
            daemons: BTreeMap::new(),
            next_conn: 0,
        }
    }

    /// Active filters in id order.
    pub fn filters(&self) -> impl Iterator<Item = (u32, &Path)> {
        self.filters.iter().map(|(&id, path)| (id, path.as_path()))
    }

    /// Pids of connected daemons.
    pub fn daemon_pids(&self) -> Vec<u32> {
        self.daemons.keys().copied().collect()
    }

    /// Add a daemon to the fan-out set. A daemon that reconnects under the
    /// same pid replaces its old connection.
    ///
    /// Returns a connection number for [`unregister`](Self::unregister).
    pub fn register(&mut self, pid: u32, peer: SocketAddr, tx: mpsc::Sender<DaemonRequest>) -> u64 {
        self.next_conn += 1;
        let conn = self.next_conn;
        if self
            .daemons
            .insert(pid, DaemonLink { conn, peer, tx })
            .is_some()
        {
            log_controller_info!("Daemon reconnected", pid = pid);
        }
        conn
    }

    /// Drop the daemon `pid`, unless it has since reconnected.
    pub fn unregister(&mut self, pid: u32, conn: u64) {
        if self.daemons.get(&pid).is_some_and(|d| d.conn == conn) {
            self.daemons.remove(&pid);
            log_controller_info!("Daemon left", pid = pid);
        }
    }

    pub async fn execute(&mut self, command: ControlCommand) -> String {
        match command {
            ControlCommand::Add { path } => self.add(path).await,
            ControlCommand::Del { id } => self.del(id).await,
            ControlCommand::Ls { pid: None } => self.ls(),
            ControlCommand::Ls { pid: Some(pid) } => self.ls_process(pid).await,
            ControlCommand::Ps => self.ps(),
        }
    }

    fn free_id(&self) -> Option<u32> {
        (0..self.max_filters).find(|id| !self.filters.contains_key(id))
    }

    async fn add(&mut self, path: PathBuf) -> String {
        if let Some((id, _)) = self.filters().find(|(_, p)| *p == path) {
            return format!("filter already installed as {}: {}", id, path.display());
        }
        let Some(id) = self.free_id() else {
            return format!("no free filter ID (max {})", self.max_filters);
        };

        let replies = self
            .fan_out(DaemonCommand::Add {
                id,
                path: path.clone(),
            })
            .await;
        let (succeeded, failed): (Vec<_>, Vec<_>) =
            replies.into_iter().partition(|(_, reply)| is_ok(reply));

        if failed.is_empty() {
            log_controller_info!(
                "Filter installed",
                filter_id = id,
                daemons = succeeded.len(),
            );
            self.filters.insert(id, path);
            return OK.to_string();
        }

        // Roll back the processes that did take it
        for (pid, _) in &succeeded {
            let Some(link) = self.daemons.get(pid) else {
                continue;
            };
            let outcome = link.ask(DaemonCommand::Del { id }).await;
            match outcome {
                Some(reply) if is_ok(&reply) => {}
                Some(reply) => log_controller_warn!(
                    "Rollback failed",
                    pid = *pid,
                    filter_id = id,
                    reply = reply.as_str()
                ),
                None => {
                    self.daemons.remove(pid);
                }
            }
        }
        log_controller_warn!("Filter rejected", filter_id = id, failures = failed.len());
        failure_report("failed to add the filter", &failed)
    }

    async fn del(&mut self, id: u32) -> String {
        if id >= self.max_filters {
            return format!("invalid filter ID {} (max {})", id, self.max_filters);
        }
        if !self.filters.contains_key(&id) {
            return format!("no such filter: {}", id);
        }

        let replies = self.fan_out(DaemonCommand::Del { id }).await;
        self.filters.remove(&id);

        let failed: Vec<_> = replies.into_iter().filter(|(_, r)| !is_ok(r)).collect();
        if failed.is_empty() {
            log_controller_info!("Filter removed", filter_id = id);
            OK.to_string()
        } else {
            log_controller_warn!("Filter removal failed", filter_id = id, failures = failed.len());
            failure_report("failed to delete the filter", &failed)
        }
    }

    fn ls(&self) -> String {
        let mut out = String::from("ID\tfile");
        for (id, path) in self.filters() {
            out.push_str(&format!("\n{}\t{}", id, path.display()));
        }
        out
    }

    async fn ls_process(&mut self, pid: u32) -> String {
        let Some(link) = self.daemons.get(&pid) else {
            return "no such process".to_string();
        };
        let outcome = link.ask(DaemonCommand::Ls).await;
        match outcome {
            Some(reply) => reply,
            None => {
                self.daemons.remove(&pid);
                "no such process".to_string()
            }
        }
    }

    fn ps(&self) -> String {
        let mut out = String::from("PID\tpeer");
        for (pid, link) in &self.daemons {
            out.push_str(&format!("\n{}\t{}", pid, link.peer));
        }
        out
    }

    /// Send `command` to every daemon and collect `(pid, reply)` pairs.
    ///
    /// All requests go out before any reply is awaited, so daemons work in
    /// parallel. Daemons whose connection is gone are dropped from the set
    /// and do not count as failures.
    async fn fan_out(&mut self, command: DaemonCommand) -> Vec<(u32, String)> {
        let mut pending = Vec::with_capacity(self.daemons.len());
        let mut gone = Vec::new();
        for (&pid, link) in &self.daemons {
            let (reply, rx) = oneshot::channel();
            let request = DaemonRequest {
                command: command.clone(),
                reply,
            };
            match link.tx.send(request).await {
                Ok(()) => pending.push((pid, rx)),
                Err(_) => gone.push(pid),
            }
        }

        let mut replies = Vec::with_capacity(pending.len());
        for (pid, rx) in pending {
            match rx.await {
                Ok(reply) => replies.push((pid, reply)),
                Err(_) => gone.push(pid),
            }
        }
        for pid in gone {
            log_controller_warn!("Dropping unreachable daemon", pid = pid);
            self.daemons.remove(&pid);
        }
        replies
    }
}

fn failure_report(head: &str, failed: &[(u32, String)]) -> String {
    let mut out = head.to_string();
    for (pid, reply) in failed {
        out.push_str(&format!("\n{}\t{}", pid, reply));
    }
    out
}
