//! Client bridge.
//!
//! [`Executor`] turns caller actions into protocol requests and supervisor
//! events back into outcomes for the caller that asked. Every request first
//! registers where its answer should go, then makes sure the channel is bound,
//! then sends. A failed bind or send withdraws the registration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shellvisor_core::config::ClientConfig;
use shellvisor_proto::Request;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::binding::{Binder, ConnectionState};
use crate::connection::SocketConnector;
use crate::error::BridgeError;
use crate::library::LibraryLoader;
use crate::pending::{JobUpdate, PendingKind, PendingTable};

/// How an [`Executor`] reaches the supervisor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub socket_path: PathBuf,
    /// Stable identity announced on every connection. Random when unset.
    pub client_id: Option<String>,
    pub bind_timeout: Duration,
    /// Daemon binary to launch when nothing is listening.
    pub autostart: Option<PathBuf>,
}

impl ExecutorConfig {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            client_id: None,
            bind_timeout: Duration::from_secs(5),
            autostart: None,
        }
    }

    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            socket_path: config.socket_path(),
            client_id: None,
            bind_timeout: Duration::from_secs(config.bind_timeout_secs),
            autostart: config.autostart.then(|| config.daemon_bin.clone()),
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub const fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }
}

/// Output stream of a started job.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    updates: mpsc::UnboundedReceiver<JobUpdate>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next stdout/stderr line, the exit, or [`JobUpdate::Disconnected`]
    /// when the channel drops. `None` once the stream is over: after the
    /// exit, after a successful stop, or after the executor shut down.
    pub async fn next(&mut self) -> Option<JobUpdate> {
        self.updates.recv().await
    }

    /// Discard output and wait for the exit code. `None` if the stream ended
    /// or the channel dropped before one arrived.
    pub async fn wait(mut self) -> Option<i32> {
        while let Some(update) = self.next().await {
            match update {
                JobUpdate::Exit(code) => return Some(code),
                JobUpdate::Disconnected => return None,
                JobUpdate::Stdout(_) | JobUpdate::Stderr(_) => {}
            }
        }
        None
    }
}

/// Action façade over the supervisor connection.
pub struct Executor {
    client_id: String,
    binder: Binder<SocketConnector>,
    pending: Arc<PendingTable>,
    libraries: LibraryLoader,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let client_id = config
            .client_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let pending = Arc::new(PendingTable::new());
        let mut connector = SocketConnector::new(
            config.socket_path,
            client_id.clone(),
            Arc::clone(&pending),
        );
        if let Some(daemon_bin) = config.autostart {
            connector = connector.with_autostart(daemon_bin);
        }

        Self {
            client_id,
            binder: Binder::new(connector, config.bind_timeout),
            pending,
            libraries: LibraryLoader::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.binder.state()
    }

    /// Start `command` under the supervisor. Returns once the request is
    /// sent; output and exit arrive on the handle.
    pub async fn start(&self, command: &str, use_init_script: bool) -> Result<JobHandle, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let updates = self.pending.register_job(&id).await?;
        let request = Request::Start {
            id: id.clone(),
            cmd: command.to_string(),
            alpine: use_init_script,
        };
        if let Err(e) = self.send(&request).await {
            self.pending.cancel(PendingKind::Job, &id).await;
            return Err(e);
        }
        debug!(job_id = %id, "Job requested");
        Ok(JobHandle { id, updates })
    }

    /// Write `text` plus a newline to the job's stdin.
    pub async fn write(&self, id: &str, text: &str) -> Result<String, BridgeError> {
        self.request(
            PendingKind::Write,
            id,
            Request::Write {
                id: id.to_string(),
                input: text.to_string(),
            },
        )
        .await
    }

    /// Kill the job's process group. Any open stream for the job ends.
    pub async fn stop(&self, id: &str) -> Result<String, BridgeError> {
        self.request(PendingKind::Stop, id, Request::Stop { id: id.to_string() })
            .await
    }

    /// `"running"` or `"not_found"`.
    pub async fn is_running(&self, id: &str) -> Result<String, BridgeError> {
        self.request(
            PendingKind::Query,
            id,
            Request::IsRunning { id: id.to_string() },
        )
        .await
    }

    /// Run `command` to completion. Success carries trimmed stdout; failure
    /// is [`BridgeError::Rejected`] with trimmed stderr or the exit code.
    pub async fn exec(&self, command: &str, use_init_script: bool) -> Result<String, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.request(
            PendingKind::Exec,
            &id,
            Request::Exec {
                id: id.clone(),
                cmd: command.to_string(),
                alpine: use_init_script,
            },
        )
        .await
    }

    /// Load a native library into this process. Does not touch the channel.
    pub fn load_library(&self, path: &Path) -> Result<String, BridgeError> {
        self.libraries.load(path)
    }

    /// Flip the supervisor's keep-awake lock.
    pub async fn toggle_keep_awake(&self) -> Result<(), BridgeError> {
        self.send(&Request::ToggleKeepAwake).await
    }

    /// Drop the channel without stopping the supervisor. Job streams stay
    /// registered; the next request rebinds and resumes them.
    pub fn detach(&self) {
        if self.binder.unbind().is_some() {
            info!(client_id = %self.client_id, "Detached from supervisor");
        }
    }

    /// Stop the supervisor and every job, then tear down the channel.
    pub async fn stop_service(&self) -> Result<(), BridgeError> {
        let result = self.send(&Request::Shutdown).await;
        self.binder.unbind();
        self.pending.close_all().await;
        info!(client_id = %self.client_id, "Supervisor stop requested");
        result
    }

    async fn send(&self, request: &Request) -> Result<(), BridgeError> {
        let link = self.binder.ensure_bound().await?;
        link.send(request).await?;
        Ok(())
    }

    async fn request(
        &self,
        kind: PendingKind,
        id: &str,
        request: Request,
    ) -> Result<String, BridgeError> {
        let reply = self.pending.register_reply(kind, id).await?;
        if let Err(e) = self.send(&request).await {
            self.pending.cancel(kind, id).await;
            return Err(e);
        }
        reply.await.unwrap_or(Err(BridgeError::ChannelLost))
    }
}
