//! Unix socket server.
//!
//! Accepts client connections, reads NDJSON requests, and writes events back
//! through a per-connection outbound queue registered in the client table.

use std::path::PathBuf;
use std::sync::Arc;

use shellvisor_core::config::SupervisorConfig;
use shellvisor_proto::{Event, Request, decode, encode};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clients::ConnectionId;
use crate::supervisor::Supervisor;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Supervisor already running on {}", path.display())]
    AlreadyRunning { path: PathBuf },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket the daemon listens on.
    pub socket_path: PathBuf,

    /// Events buffered per connection before job output applies backpressure.
    pub outbound_capacity: usize,
}

impl ServerConfig {
    pub const fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            outbound_capacity: 256,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.socket_path())
    }

    /// Set the per-connection outbound queue size.
    #[must_use]
    pub const fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

/// Socket front end for a [`Supervisor`].
pub struct SupervisorServer {
    config: ServerConfig,
    supervisor: Arc<Supervisor>,
}

impl SupervisorServer {
    pub const fn new(config: ServerConfig, supervisor: Arc<Supervisor>) -> Self {
        Self { config, supervisor }
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Bind the socket and serve until the supervisor shuts down.
    ///
    /// A stale socket file from an earlier run is replaced; a socket that
    /// still accepts connections is left alone and reported as
    /// [`ServerError::AlreadyRunning`]. The socket file is removed again on
    /// return.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let path = &self.config.socket_path;
        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => return Err(ServerError::AlreadyRunning { path: path.clone() }),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    ) =>
                {
                    debug!(path = %path.display(), "Removing stale socket");
                    if let Err(e) = std::fs::remove_file(path)
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Listening on Unix socket");

        self.serve_listener(listener).await;

        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %e, "Socket file already gone");
        }
        Ok(())
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve_listener(&self, listener: UnixListener) {
        let mut shutdown = self.supervisor.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = Arc::clone(&self.supervisor);
                        let capacity = self.config.outbound_capacity;
                        tokio::spawn(async move {
                            handle_connection(supervisor, stream, capacity).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    info!("Server stopping");
                    break;
                }
            }
        }
    }
}

/// Serve one client connection until it closes.
///
/// The connection starts under a random client id and switches to the id
/// announced in `hello`, taking over event delivery for that client.
async fn handle_connection(supervisor: Arc<Supervisor>, stream: UnixStream, capacity: usize) {
    let clients = Arc::clone(supervisor.clients());
    let connection = clients.next_connection_id();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(write_events(write_half, rx, connection));

    let mut client_id = uuid::Uuid::new_v4().to_string();
    clients.attach(&client_id, connection, tx.clone()).await;
    debug!(connection, "Connection accepted");

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(connection, error = %e, "Connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode::<Request>(&line) {
            Ok(Request::Hello {
                client_id: announced,
            }) => {
                if announced != client_id {
                    clients.detach(&client_id, connection).await;
                    client_id = announced;
                    clients.attach(&client_id, connection, tx.clone()).await;
                }
            }
            Ok(request) => {
                debug!(connection, client_id, job_id = request.job_id(), ?request, "Request");
                supervisor.handle(&client_id, request).await;
            }
            Err(e) => {
                warn!(connection, client_id, error = %e, "Undecodable request");
                let _ = tx.send(Event::Error { data: e.to_string() }).await;
            }
        }
    }

    clients.detach(&client_id, connection).await;
    debug!(connection, client_id, "Connection closed");
}

async fn write_events(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Event>,
    connection: ConnectionId,
) {
    while let Some(event) = rx.recv().await {
        let line = match encode(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(connection, error = %e, "Failed to encode event");
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(connection, error = %e, "Connection write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
