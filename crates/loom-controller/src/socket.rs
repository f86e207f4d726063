//! TCP listener for the controller
//!
//! Every connection opens with a handshake frame and is then served by its
//! own task: operator connections run commands, daemon connections relay
//! requests from the command side.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use loom_config::{log_controller_debug, log_controller_info, log_controller_warn};
use loom_ipc::{
    is_ok, read_frame_async, write_frame_async, ControlCommand, DaemonCommand, Hello,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::commands::DaemonRequest;
use crate::Controller;

/// Requests queued for one daemon before senders wait.
const DAEMON_QUEUE: usize = 16;

/// Accept connections forever.
pub async fn serve(listener: tokio::net::TcpListener, controller: Arc<Controller>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, controller).await {
                        tracing::warn!(component = "CONTROLLER", peer = %peer, error = %e, "Connection error");
                    }
                });
            }
            Err(e) => {
                tracing::error!(component = "CONTROLLER", error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    controller: Arc<Controller>,
) -> Result<()> {
    let Some(line) = read_frame_async(&mut stream).await? else {
        return Ok(());
    };
    match line.parse::<Hello>() {
        Ok(Hello::Ctl) => serve_ctl(stream, controller).await,
        Ok(Hello::Daemon { pid }) => serve_daemon(stream, peer, pid, controller).await,
        Err(e) => {
            log_controller_warn!(
                "Bad handshake, dropping connection",
                line = line.as_str(),
                error = e.to_string()
            );
            Ok(())
        }
    }
}

async fn serve_ctl(mut stream: TcpStream, controller: Arc<Controller>) -> Result<()> {
    log_controller_debug!("Operator connected");
    while let Some(line) = read_frame_async(&mut stream).await? {
        let reply = match line.parse::<ControlCommand>() {
            Ok(command) => {
                log_controller_info!("Operator command", command = line.as_str());
                controller.execute(command).await
            }
            Err(e) => e.to_string(),
        };
        write_frame_async(&mut stream, &reply).await?;
    }
    Ok(())
}

/// One request/reply exchange with a daemon.
async fn exchange(stream: &mut TcpStream, command: &DaemonCommand) -> Result<String> {
    write_frame_async(stream, &command.to_string()).await?;
    read_frame_async(stream)
        .await?
        .ok_or_else(|| anyhow::anyhow!("daemon closed the connection"))
}

async fn serve_daemon(
    mut stream: TcpStream,
    peer: SocketAddr,
    pid: u32,
    controller: Arc<Controller>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<DaemonRequest>(DAEMON_QUEUE);

    // Replay under the lock, so no add or del slips in between the replay
    // and the daemon joining the fan-out set.
    let conn = {
        let mut state = controller.lock().await;
        let active: Vec<_> = state
            .filters()
            .map(|(id, path)| DaemonCommand::Add {
                id,
                path: path.to_path_buf(),
            })
            .collect();
        for command in &active {
            let reply = exchange(&mut stream, command).await?;
            if !is_ok(&reply) {
                log_controller_warn!(
                    "Replay failed",
                    pid = pid,
                    command = command.to_string(),
                    reply = reply.as_str()
                );
            }
        }
        state.register(pid, peer, tx)
    };
    log_controller_info!("Daemon joined", pid = pid, peer = peer.to_string());

    let outcome = relay(&mut stream, &mut rx).await;
    drop(rx);
    controller.lock().await.unregister(pid, conn);
    outcome
}

/// Forward queued requests to the daemon until either side hangs up.
///
/// Daemons only speak when spoken to, so anything read while idle is either
/// a hangup or a protocol violation.
async fn relay(stream: &mut TcpStream, rx: &mut mpsc::Receiver<DaemonRequest>) -> Result<()> {
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else {
                    return Ok(());
                };
                let reply = exchange(stream, &request.command).await?;
                let _ = request.reply.send(reply);
            }
            unsolicited = read_frame_async(stream) => {
                match unsolicited? {
                    None => return Ok(()),
                    Some(line) => {
                        log_controller_warn!("Unsolicited frame from daemon", line = line.as_str())
                    }
                }
            }
        }
    }
}
