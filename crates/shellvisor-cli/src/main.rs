//! shellvisor command-line client
//!
//! Exposes each bridge action as a subcommand and prints its outcome.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::debug;

use shellvisor_cli::{BridgeError, Executor, ExecutorConfig, JobUpdate};

#[derive(Parser, Debug)]
#[command(name = "shellvisor")]
#[command(version, about = "shellvisor - run shell jobs through the supervisor daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file layered over the global settings
    #[arg(long, global = true, env = "SHELLVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Daemon socket
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Client identity; reuse it to resume a job's events after reconnecting
    #[arg(long, global = true, env = "SHELLVISOR_CLIENT_ID")]
    client_id: Option<String>,

    /// Launch the daemon if it is not running
    #[arg(long, global = true)]
    autostart: bool,

    /// Seconds to wait for the daemon connection
    #[arg(long, global = true)]
    bind_timeout: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true, env = "SHELLVISOR_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a job and stream its output until it exits
    Start {
        /// Shell command line
        command: String,
        /// Source the sandbox init script before the command
        #[arg(long)]
        init: bool,
    },
    /// Write a line to a job's stdin
    Write {
        /// Job id
        id: String,
        /// Text to write (a newline is appended)
        text: String,
    },
    /// Kill a job's process group
    Stop {
        /// Job id
        id: String,
    },
    /// Report whether a job is running
    IsRunning {
        /// Job id
        id: String,
    },
    /// Run a command to completion and print its output
    Exec {
        /// Shell command line
        command: String,
        /// Source the sandbox init script before the command
        #[arg(long)]
        init: bool,
    },
    /// Load a native library into this process
    LoadLibrary {
        /// Library path
        path: PathBuf,
    },
    /// Stop the daemon and every job
    StopService,
    /// Toggle the daemon's keep-awake lock
    ToggleKeepAwake,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = shellvisor_core::config::load_config(cli.config.as_deref())?;

    let log_level = cli.log_level.clone().unwrap_or(config.log_level);
    shellvisor_core::tracing_init::init_tracing(
        &format!("shellvisor_cli={log_level},shellvisor={log_level}"),
        cli.log_json,
    )?;

    let mut client = config.client;
    if let Some(socket) = cli.socket {
        client.socket_path = Some(socket);
    }
    if let Some(secs) = cli.bind_timeout {
        client.bind_timeout_secs = secs;
    }
    // Starting a daemon only to stop it is pointless.
    client.autostart =
        (client.autostart || cli.autostart) && !matches!(cli.command, Command::StopService);

    let mut executor_config = ExecutorConfig::from_client_config(&client);
    if let Some(client_id) = cli.client_id {
        executor_config = executor_config.with_client_id(client_id);
    }
    let executor = Executor::new(executor_config);
    debug!(client_id = executor.client_id(), "Executor ready");

    let outcome = match cli.command {
        Command::Start { command, init } => return run_job(&executor, &command, init).await,
        Command::Write { id, text } => executor.write(&id, &text).await,
        Command::Stop { id } => executor.stop(&id).await,
        Command::IsRunning { id } => executor.is_running(&id).await,
        Command::Exec { command, init } => executor.exec(&command, init).await,
        Command::LoadLibrary { path } => executor.load_library(&path),
        Command::StopService => executor
            .stop_service()
            .await
            .map(|()| "Service stopped".to_string()),
        Command::ToggleKeepAwake => executor
            .toggle_keep_awake()
            .await
            .map(|()| "Keep-awake toggled".to_string()),
    };

    Ok(report(outcome))
}

fn report(outcome: Result<String, BridgeError>) -> ExitCode {
    match outcome {
        Ok(text) => {
            if !text.is_empty() {
                println!("{text}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Stream a job's output; Ctrl-C stops the job. Exits with the job's code.
async fn run_job(executor: &Executor, command: &str, init: bool) -> anyhow::Result<ExitCode> {
    let mut job = match executor.start(command, init).await {
        Ok(job) => job,
        Err(e) => return Ok(report(Err(e))),
    };
    eprintln!("{}", job.id());

    loop {
        tokio::select! {
            update = job.next() => match update {
                Some(JobUpdate::Stdout(line)) => println!("{line}"),
                Some(JobUpdate::Stderr(line)) => eprintln!("{line}"),
                Some(JobUpdate::Exit(code)) => {
                    debug!(job_id = job.id(), code, "Job exited");
                    return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
                }
                Some(JobUpdate::Disconnected) => {
                    eprintln!("Connection to supervisor lost");
                    return Ok(ExitCode::FAILURE);
                }
                None => return Ok(ExitCode::FAILURE),
            },
            _ = tokio::signal::ctrl_c() => {
                let stopped = executor.stop(job.id()).await;
                return Ok(report(stopped));
            }
        }
    }
}
