//! shellvisor daemon
//!
//! Supervises shell jobs on behalf of clients connected over a local socket.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use shellvisor_daemon::clients::ClientTable;
use shellvisor_daemon::host::Host;
use shellvisor_daemon::server::{ServerConfig, SupervisorServer};
use shellvisor_daemon::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "shellvisord")]
#[command(version, about = "shellvisor daemon - shell job supervisor")]
struct Args {
    /// Config file layered over the global settings
    #[arg(long, env = "SHELLVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Private storage directory exported to jobs as PREFIX
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Native library directory exported to jobs as NATIVE_DIR
    #[arg(long)]
    native_dir: Option<PathBuf>,

    /// Host target platform version (drives FDROID)
    #[arg(long)]
    target_sdk: Option<u32>,

    /// Shell used to run job commands
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SHELLVISOR_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = shellvisor_core::config::load_config(args.config.as_deref())?;

    let supervisor_config = &mut config.supervisor;
    if let Some(socket) = args.socket {
        supervisor_config.socket_path = Some(socket);
    }
    if let Some(base_dir) = args.base_dir {
        supervisor_config.base_dir = base_dir;
    }
    if let Some(native_dir) = args.native_dir {
        supervisor_config.native_lib_dir = native_dir;
    }
    if let Some(version) = args.target_sdk {
        supervisor_config.target_sdk_version = Some(version);
    }
    if let Some(shell) = args.shell {
        supervisor_config.shell = shell;
    }

    let log_level = args.log_level.unwrap_or(config.log_level);
    shellvisor_core::tracing_init::init_tracing(
        &format!("shellvisor_daemon={log_level},shellvisord={log_level}"),
        args.log_json,
    )?;

    let server_config = ServerConfig::from_config(&config.supervisor);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %server_config.socket_path.display(),
        base_dir = %config.supervisor.base_dir.display(),
        compat = ?config.supervisor.compat_mode(),
        "Starting shellvisord"
    );

    let supervisor = Supervisor::new(
        &config.supervisor,
        Arc::new(ClientTable::new()),
        Host::logging(),
    );
    let server = SupervisorServer::new(server_config, Arc::clone(&supervisor));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = server.serve() => {
            result?;
            info!("Shutdown requested by client");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Idempotent when a client already requested shutdown.
    supervisor.shutdown().await;
    let _ = std::fs::remove_file(&server.config().socket_path);

    info!("Daemon stopped");
    Ok(())
}
