//! Socket connector for the supervisor daemon.
//!
//! Opens the Unix socket, announces the client id, and runs a reader task
//! that routes incoming events into the [`PendingTable`]. When nothing is
//! listening and autostart is enabled, the daemon binary is launched and the
//! socket polled until it answers.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use shellvisor_proto::{Event, Request, decode, encode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binding::{Connector, LossHandle};
use crate::error::{BridgeError, ConnectionError};
use crate::pending::PendingTable;

/// Interval between connection attempts while an autostarted daemon comes up.
const AUTOSTART_POLL: Duration = Duration::from_millis(50);

/// Connects to the daemon's Unix socket.
pub struct SocketConnector {
    socket_path: PathBuf,
    client_id: String,
    daemon_bin: Option<PathBuf>,
    pending: Arc<PendingTable>,
}

impl SocketConnector {
    pub const fn new(socket_path: PathBuf, client_id: String, pending: Arc<PendingTable>) -> Self {
        Self {
            socket_path,
            client_id,
            daemon_bin: None,
            pending,
        }
    }

    /// Launch `daemon_bin` when the socket has no listener.
    #[must_use]
    pub fn with_autostart(mut self, daemon_bin: PathBuf) -> Self {
        self.daemon_bin = Some(daemon_bin);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn open(&self) -> Result<UnixStream, ConnectionError> {
        let error = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        let Some(daemon_bin) = &self.daemon_bin else {
            return Err(self.connect_failed(&error));
        };
        if !matches!(
            error.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        ) {
            return Err(self.connect_failed(&error));
        }

        self.launch_daemon(daemon_bin)?;
        // Bounded by the binder's timeout, which drops this future.
        loop {
            tokio::time::sleep(AUTOSTART_POLL).await;
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!(error = %e, "Daemon not accepting yet"),
            }
        }
    }

    fn launch_daemon(&self, daemon_bin: &Path) -> Result<(), ConnectionError> {
        let mut cmd = tokio::process::Command::new(daemon_bin);
        cmd.arg("--socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ConnectionError::AutostartFailed(format!("{}: {e}", daemon_bin.display())))?;
        info!(
            daemon = %daemon_bin.display(),
            pid = ?child.id(),
            socket = %self.socket_path.display(),
            "Started supervisor daemon"
        );
        Ok(())
    }

    fn connect_failed(&self, error: &io::Error) -> ConnectionError {
        ConnectionError::ConnectFailed(format!("{}: {error}", self.socket_path.display()))
    }
}

impl Connector for SocketConnector {
    type Link = Link;

    async fn connect(&self, lost: LossHandle) -> Result<Link, ConnectionError> {
        let stream = self.open().await?;
        Link::establish(stream, &self.client_id, Arc::clone(&self.pending), lost).await
    }
}

/// A bound channel to the daemon. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    writer: Mutex<OwnedWriteHalf>,
    reader: JoinHandle<()>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Link {
    async fn establish(
        stream: UnixStream,
        client_id: &str,
        pending: Arc<PendingTable>,
        lost: LossHandle,
    ) -> Result<Self, ConnectionError> {
        let (read_half, mut write_half) = stream.into_split();
        write_request(
            &mut write_half,
            &Request::Hello {
                client_id: client_id.to_string(),
            },
        )
        .await?;

        let reader = tokio::spawn(read_events(read_half, pending, lost));
        debug!(client_id, "Channel established");
        Ok(Self {
            inner: Arc::new(LinkInner {
                writer: Mutex::new(write_half),
                reader,
            }),
        })
    }

    /// Send one request line.
    pub async fn send(&self, request: &Request) -> Result<(), ConnectionError> {
        let mut writer = self.inner.writer.lock().await;
        write_request(&mut writer, request).await
    }
}

async fn write_request(
    writer: &mut OwnedWriteHalf,
    request: &Request,
) -> Result<(), ConnectionError> {
    let line = encode(request).map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ConnectionError::SendFailed(e.to_string()))
}

async fn read_events(read_half: OwnedReadHalf, pending: Arc<PendingTable>, lost: LossHandle) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match decode::<Event>(&line) {
                Ok(event) => pending.route(event).await,
                Err(e) => warn!(error = %e, "Undecodable event from supervisor"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Channel read failed");
                break;
            }
        }
    }
    info!("Channel to supervisor closed");
    lost.fire();
    pending.fail_replies(&BridgeError::ChannelLost).await;
    pending.notify_streams_lost().await;
}
