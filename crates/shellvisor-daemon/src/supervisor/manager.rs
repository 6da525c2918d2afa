//! Process supervisor.
//!
//! Owns the job registry and turns protocol requests into process operations.
//! Each started job gets a stdin writer task, one reader task per output
//! stream, and an exit watcher that reports the exit code and retires the job.

use std::io;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use shellvisor_core::config::SupervisorConfig;
use shellvisor_proto::{Event, JobId, Request, RunState};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SupervisorError;
use super::command::ShellLauncher;
use super::registry::{JobEntry, JobRegistry, StdinWrite};
use super::streamer::{StreamKind, spawn_streamer};
use crate::clients::ClientTable;
use crate::host::Host;

/// Exit code reported after a failed spawn.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;
/// Acknowledgement text for a successful write.
pub const WRITE_OK: &str = "Written to process";
/// Acknowledgement text for a stop.
pub const STOP_OK: &str = "Process terminated";

/// How long the exit watcher lets output readers drain before reporting exit.
const STREAM_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Aggregated result of an `exec` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub is_success: bool,
    pub data: String,
}

impl ExecOutcome {
    fn from_output(output: &Output) -> Self {
        if output.status.success() {
            return Self {
                is_success: true,
                data: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            };
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let data = if stderr.is_empty() {
            format!("Command exited with code: {}", exit_code(output.status))
        } else {
            stderr
        };
        Self {
            is_success: false,
            data,
        }
    }
}

/// Handles the child carries from spawn into its supervision tasks.
struct Spawned {
    child: Child,
    stdin: Option<ChildStdin>,
    stdin_rx: mpsc::UnboundedReceiver<StdinWrite>,
    exit_tx: watch::Sender<Option<i32>>,
    kill_rx: oneshot::Receiver<()>,
}

/// The process supervisor.
pub struct Supervisor {
    registry: JobRegistry,
    clients: Arc<ClientTable>,
    launcher: ShellLauncher,
    host: Host,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, clients: Arc<ClientTable>, host: Host) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        host.publish();
        Arc::new(Self {
            registry: JobRegistry::new(),
            clients,
            launcher: ShellLauncher::from_config(config),
            host,
            shutdown_tx,
        })
    }

    pub fn clients(&self) -> &Arc<ClientTable> {
        &self.clients
    }

    pub const fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub const fn host(&self) -> &Host {
        &self.host
    }

    /// Resolves to `true` once [`Supervisor::shutdown`] has run.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Dispatch one request from `client_id`.
    ///
    /// Start, write enqueueing, stop and queries run inline so requests from
    /// one connection take effect in the order they were sent. Exec and write
    /// completion run on their own tasks.
    pub async fn handle(self: &Arc<Self>, client_id: &str, request: Request) {
        match request {
            // Identity is bound by the connection before dispatch.
            Request::Hello { .. } => {}
            Request::Start { id, cmd, alpine } => {
                let _ = self.start(client_id, id, &cmd, alpine).await;
            }
            Request::Write { id, input } => {
                let pending = self.enqueue_write(&id, input).await;
                let this = Arc::clone(self);
                let client_id = client_id.to_string();
                tokio::spawn(async move {
                    let result = match pending {
                        Ok(reply) => await_write(&id, reply).await,
                        Err(e) => Err(e),
                    };
                    let (is_success, data) = match result {
                        Ok(()) => (true, WRITE_OK.to_string()),
                        Err(e) => (false, e.to_string()),
                    };
                    this.clients
                        .send(
                            &client_id,
                            Event::WriteResult {
                                id,
                                is_success,
                                data,
                            },
                        )
                        .await;
                });
            }
            Request::Stop { id } => {
                self.stop(&id).await;
                self.clients
                    .send(
                        client_id,
                        Event::StopResult {
                            id,
                            is_success: true,
                            data: STOP_OK.to_string(),
                        },
                    )
                    .await;
            }
            Request::IsRunning { id } => {
                let data = self.is_running(&id).await;
                self.clients
                    .send(client_id, Event::IsRunning { id, data })
                    .await;
            }
            Request::Exec { id, cmd, alpine } => {
                let this = Arc::clone(self);
                let client_id = client_id.to_string();
                tokio::spawn(async move {
                    let outcome = this.exec(&cmd, alpine).await;
                    this.clients
                        .send(
                            &client_id,
                            Event::ExecResult {
                                id,
                                is_success: outcome.is_success,
                                data: outcome.data,
                            },
                        )
                        .await;
                });
            }
            Request::ToggleKeepAwake => {
                self.host.toggle_keep_awake();
            }
            Request::Shutdown => {
                info!(client_id, "Shutdown requested");
                self.shutdown().await;
            }
        }
    }

    /// Spawn `command` as job `id` and begin streaming its output to
    /// `client_id`.
    ///
    /// Failures are reported to the client as well as returned: a duplicate
    /// id as an `error` event, a spawn failure as one `stderr` line followed
    /// by `exit` with [`SPAWN_FAILURE_EXIT_CODE`].
    pub async fn start(
        self: &Arc<Self>,
        client_id: &str,
        id: JobId,
        command: &str,
        use_init_script: bool,
    ) -> Result<(), SupervisorError> {
        let launcher = &self.launcher;
        let spawned = self
            .registry
            .insert_with(&id, || {
                let mut child = launcher
                    .command(command, use_init_script)
                    .spawn()
                    .map_err(|e| SupervisorError::SpawnFailed {
                        reason: e.to_string(),
                    })?;
                let pid = child.id();
                let stdin = child.stdin.take();
                let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
                let (exit_tx, exit_rx) = watch::channel(None);
                let (kill_tx, kill_rx) = oneshot::channel();
                let entry = JobEntry::new(client_id.to_string(), pid, stdin_tx, exit_rx, kill_tx);
                Ok((
                    entry,
                    Spawned {
                        child,
                        stdin,
                        stdin_rx,
                        exit_tx,
                        kill_rx,
                    },
                ))
            })
            .await;

        let mut spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.report_start_failure(client_id, &id, &e).await;
                return Err(e);
            }
        };

        info!(
            job_id = %id,
            client_id,
            pid = ?spawned.child.id(),
            use_init_script,
            "Job started"
        );

        spawn_stdin_writer(id.clone(), spawned.stdin.take(), spawned.stdin_rx);

        let mut streams = Vec::with_capacity(2);
        if let Some(stdout) = spawned.child.stdout.take() {
            streams.push(spawn_streamer(
                stdout,
                StreamKind::Stdout,
                id.clone(),
                client_id.to_string(),
                Arc::clone(&self.clients),
            ));
        }
        if let Some(stderr) = spawned.child.stderr.take() {
            streams.push(spawn_streamer(
                stderr,
                StreamKind::Stderr,
                id.clone(),
                client_id.to_string(),
                Arc::clone(&self.clients),
            ));
        }

        let this = Arc::clone(self);
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            this.watch_exit(
                id,
                client_id,
                spawned.child,
                spawned.kill_rx,
                spawned.exit_tx,
                streams,
            )
            .await;
        });
        Ok(())
    }

    async fn report_start_failure(&self, client_id: &str, id: &str, error: &SupervisorError) {
        match error {
            SupervisorError::SpawnFailed { .. } => {
                warn!(job_id = %id, client_id, error = %error, "Job failed to start");
                self.clients
                    .send(
                        client_id,
                        Event::Stderr {
                            id: id.to_string(),
                            data: error.to_string(),
                        },
                    )
                    .await;
                self.clients
                    .send(
                        client_id,
                        Event::Exit {
                            id: id.to_string(),
                            data: SPAWN_FAILURE_EXIT_CODE,
                        },
                    )
                    .await;
            }
            _ => {
                warn!(job_id = %id, client_id, error = %error, "Start rejected");
                self.clients
                    .send(
                        client_id,
                        Event::Error {
                            data: error.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Wait for the child to end, then report its exit code unless a stop or
    /// shutdown already retired the job.
    async fn watch_exit(
        self: Arc<Self>,
        id: JobId,
        client_id: String,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<i32>>,
        streams: Vec<JoinHandle<()>>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    debug!(job_id = %id, error = %e, "Kill after stop failed");
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to wait for job");
                -1
            }
        };
        let _ = exit_tx.send(Some(code));

        let deadline = tokio::time::Instant::now() + STREAM_DRAIN_GRACE;
        for stream in streams {
            if tokio::time::timeout_at(deadline, stream).await.is_err() {
                debug!(job_id = %id, "Output still open after exit, not waiting further");
                break;
            }
        }

        if self.registry.remove(&id).await.is_some() {
            info!(job_id = %id, client_id, code, "Job exited");
            self.clients
                .send(&client_id, Event::Exit { id, data: code })
                .await;
        } else {
            debug!(job_id = %id, code, "Job already retired, exit not reported");
        }
    }

    /// Queue `text` plus a newline for the job's stdin.
    ///
    /// The returned receiver resolves once the line has been written and
    /// flushed. Queue order is write order.
    pub async fn enqueue_write(
        &self,
        id: &str,
        text: String,
    ) -> Result<oneshot::Receiver<io::Result<()>>, SupervisorError> {
        let stdin = self
            .registry
            .stdin(id)
            .await
            .ok_or_else(|| SupervisorError::JobNotFound { id: id.to_string() })?;
        let (reply, rx) = oneshot::channel();
        stdin
            .send(StdinWrite { text, reply })
            .map_err(|_| SupervisorError::JobExited { id: id.to_string() })?;
        Ok(rx)
    }

    /// Write `text` plus a newline to the job's stdin and flush.
    pub async fn write(&self, id: &str, text: String) -> Result<(), SupervisorError> {
        let reply = self.enqueue_write(id, text).await?;
        await_write(id, reply).await
    }

    /// Kill the job's process group and retire it. Returns whether a live job
    /// was found; stopping an unknown id is not an error.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(entry) = self.registry.remove(id).await else {
            debug!(job_id = %id, "Stop for unknown job");
            return false;
        };
        if let Some(pid) = entry.pid() {
            kill_process_group(pid);
        }
        entry.destroy();
        info!(job_id = %id, "Job stopped");
        true
    }

    pub async fn is_running(&self, id: &str) -> RunState {
        self.registry.run_state(id).await
    }

    /// Run `command` to completion and aggregate its output.
    pub async fn exec(&self, command: &str, use_init_script: bool) -> ExecOutcome {
        let mut cmd = self.launcher.command(command, use_init_script);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        debug!(command, use_init_script, "Exec");
        match cmd.output().await {
            Ok(output) => ExecOutcome::from_output(&output),
            Err(e) => {
                warn!(command, error = %e, "Exec failed");
                ExecOutcome {
                    is_success: false,
                    data: format!("Exception: {e}"),
                }
            }
        }
    }

    /// Kill every job, forget every client, release the keep-awake lock and
    /// signal the server to stop.
    pub async fn shutdown(&self) {
        let jobs = self.registry.drain().await;
        info!(jobs = jobs.len(), "Supervisor shutting down");
        for (id, entry) in jobs {
            if let Some(pid) = entry.pid() {
                kill_process_group(pid);
            }
            entry.destroy();
            debug!(job_id = %id, "Job killed");
        }
        self.clients.clear().await;
        self.host.shutdown();
        self.shutdown_tx.send_replace(true);
    }
}

async fn await_write(
    id: &str,
    reply: oneshot::Receiver<io::Result<()>>,
) -> Result<(), SupervisorError> {
    match reply.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SupervisorError::WriteFailed {
            reason: e.to_string(),
        }),
        Err(_) => Err(SupervisorError::JobExited { id: id.to_string() }),
    }
}

/// Serialize writes to one job's stdin.
fn spawn_stdin_writer(
    id: JobId,
    stdin: Option<ChildStdin>,
    mut rx: mpsc::UnboundedReceiver<StdinWrite>,
) {
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            while let Some(write) = rx.recv().await {
                let _ = write
                    .reply
                    .send(Err(io::Error::from(io::ErrorKind::NotConnected)));
            }
            return;
        };
        while let Some(write) = rx.recv().await {
            let result = write_line(&mut stdin, &write.text).await;
            if let Err(e) = &result {
                debug!(job_id = %id, error = %e, "Stdin write failed");
            }
            let _ = write.reply.send(result);
        }
        debug!(job_id = %id, "Stdin writer finished");
    });
}

async fn write_line(stdin: &mut ChildStdin, text: &str) -> io::Result<()> {
    stdin.write_all(text.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Numeric exit code; `128 + signal` for a signal-terminated process.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Send SIGKILL to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        warn!(pid, "Process id out of range, not signalling");
        return;
    };
    // SAFETY: killpg(2) only sends a signal. The group was created for this
    // job by process_group(0) at spawn, so pgid equals the child's pid.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        debug!(pid, error = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(pid: u32) {
    debug!(pid, "Process groups unsupported, relying on direct kill");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn output(raw_status: i32, stdout: &str, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt;
        Output {
            status: ExitStatus::from_raw(raw_status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_maps_signals() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(7 << 8)), 7);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + 9);
    }

    #[cfg(unix)]
    #[test]
    fn exec_success_trims_stdout() {
        let outcome = ExecOutcome::from_output(&output(0, "  hello\n\n", "noise"));
        assert!(outcome.is_success);
        assert_eq!(outcome.data, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn exec_failure_prefers_stderr() {
        let outcome = ExecOutcome::from_output(&output(2 << 8, "", "boom\n"));
        assert!(!outcome.is_success);
        assert_eq!(outcome.data, "boom");
    }

    #[cfg(unix)]
    #[test]
    fn exec_failure_without_stderr_names_code() {
        let outcome = ExecOutcome::from_output(&output(7 << 8, "ignored", " \n"));
        assert!(!outcome.is_success);
        assert_eq!(outcome.data, "Command exited with code: 7");
    }

    #[test]
    fn spawn_failure_text() {
        let err = SupervisorError::SpawnFailed {
            reason: "No such file or directory (os error 2)".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to start process: No such file or directory (os error 2)"
        );
    }
}
