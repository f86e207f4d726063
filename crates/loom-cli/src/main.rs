//! # loomctl
//!
//! Operator command line for Loom: installs and removes filters in every
//! instrumented process through the controller, and runs the controller
//! itself.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loom_config::logging::{init_logging, LogLevel};
use loom_config::path::{is_wire_safe, normalize_for_ipc};
use loom_config::{log_ctl_debug, log_ctl_info, Config};
use loom_ipc::client::ControllerClient;
use loom_ipc::{is_ok, ControlCommand};

/// Loom - live updates for running multithreaded programs
#[derive(Parser)]
#[command(name = "loomctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Controller host (overrides config and LOOM_CONTROLLER_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Controller port (overrides config and LOOM_CONTROLLER_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a compiled filter in every process
    Add {
        /// Filter file produced by the filter compiler
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Remove an installed filter from every process
    Del {
        /// Filter ID reported by `ls`
        #[arg(value_name = "ID")]
        id: u32,
    },

    /// List installed filters, or the filters inside one process
    Ls {
        #[arg(value_name = "PID")]
        pid: Option<u32>,
    },

    /// List processes connected to the controller
    Ps,

    /// Run the controller in the foreground
    Server,
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(match cli.command {
        Commands::Server => LogLevel::Info,
        _ => LogLevel::Warn,
    });

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(host) = cli.host {
        config.controller.host = host;
    }
    if let Some(port) = cli.port {
        config.controller.port = port;
    }

    match cli.command {
        Commands::Server => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            rt.block_on(loom_controller::run_server(&config))
        }
        command => {
            let request = control_command(command)?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let reply = rt.block_on(send(&config.controller.addr(), &request))?;
            println!("{}", reply);

            let must_succeed = matches!(
                request,
                ControlCommand::Add { .. } | ControlCommand::Del { .. }
            );
            if must_succeed && !is_ok(&reply) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn control_command(command: Commands) -> Result<ControlCommand> {
    Ok(match command {
        Commands::Add { file } => ControlCommand::Add {
            path: filter_path(&file)?,
        },
        Commands::Del { id } => ControlCommand::Del { id },
        Commands::Ls { pid } => ControlCommand::Ls { pid },
        Commands::Ps => ControlCommand::Ps,
        Commands::Server => bail!("server is not a controller request"),
    })
}

/// Daemons open the file from their own working directory, so it must be
/// sent as an absolute path.
fn filter_path(file: &Path) -> Result<PathBuf> {
    let path = normalize_for_ipc(file)?;
    if !is_wire_safe(&path) {
        bail!(
            "Filter path cannot be sent to the controller (contains whitespace or is not UTF-8): {}",
            path.display()
        );
    }
    Ok(path)
}

async fn send(addr: &str, request: &ControlCommand) -> Result<String> {
    log_ctl_debug!("Connecting to controller", addr = addr);
    let mut client = ControllerClient::connect(addr).await?;
    let reply = client.request(request).await?;
    log_ctl_info!("Controller replied", command = request.to_string());
    Ok(reply)
}
