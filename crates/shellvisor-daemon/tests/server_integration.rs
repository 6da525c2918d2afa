#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the Unix socket server: wire format, client
//! identity across reconnects, and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use shellvisor_core::config::SupervisorConfig;
use shellvisor_daemon::clients::ClientTable;
use shellvisor_daemon::host::Host;
use shellvisor_daemon::server::{ServerConfig, ServerError, SupervisorServer};
use shellvisor_daemon::supervisor::Supervisor;
use shellvisor_proto::{Event, Request, decode, encode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

struct Daemon {
    socket: PathBuf,
    supervisor: Arc<Supervisor>,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn spawn_daemon() -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("shellvisor.sock");
    let config = SupervisorConfig {
        base_dir: dir.path().to_path_buf(),
        native_lib_dir: dir.path().join("lib"),
        socket_path: Some(socket.clone()),
        ..SupervisorConfig::default()
    };
    let supervisor = Supervisor::new(&config, Arc::new(ClientTable::new()), Host::logging());
    let server = SupervisorServer::new(ServerConfig::from_config(&config), Arc::clone(&supervisor));
    let task = tokio::spawn(async move {
        server.serve().await.unwrap();
    });

    wait_for_socket(&socket).await;
    Daemon {
        socket,
        supervisor,
        task,
        _dir: dir,
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if UnixStream::connect(path).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket never came up");
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path, client_id: Option<&str>) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };
        if let Some(client_id) = client_id {
            client
                .send(&Request::Hello {
                    client_id: client_id.into(),
                })
                .await;
        }
        client
    }

    async fn send(&mut self, request: &Request) {
        self.send_raw(&encode(request).unwrap()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next_event(&mut self) -> Event {
        let line = tokio::time::timeout(EVENT_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for event")
            .unwrap()
            .expect("connection closed");
        decode(&line).unwrap()
    }

    async fn wait_exit(&mut self, id: &str) -> i32 {
        loop {
            if let Event::Exit { id: job, data } = self.next_event().await
                && job == id
            {
                return data;
            }
        }
    }
}

#[tokio::test]
async fn start_over_socket_streams_events() {
    let daemon = spawn_daemon().await;
    let mut client = Client::connect(&daemon.socket, Some("c1")).await;

    client
        .send(&Request::Start {
            id: "job-1".into(),
            cmd: "echo hi".into(),
            alpine: false,
        })
        .await;

    assert_eq!(
        client.next_event().await,
        Event::Stdout {
            id: "job-1".into(),
            data: "hi".into()
        }
    );
    assert_eq!(client.wait_exit("job-1").await, 0);
}

#[tokio::test]
async fn undecodable_line_gets_error_event() {
    let daemon = spawn_daemon().await;
    let mut client = Client::connect(&daemon.socket, None).await;

    client.send_raw("{\"action\":\"reboot\"}\n").await;
    assert!(matches!(client.next_event().await, Event::Error { .. }));

    // The connection stays usable.
    client.send(&Request::IsRunning { id: "x".into() }).await;
    assert!(matches!(client.next_event().await, Event::IsRunning { .. }));
}

#[tokio::test]
async fn reconnect_with_same_id_receives_exit() {
    let daemon = spawn_daemon().await;

    let mut first = Client::connect(&daemon.socket, Some("c1")).await;
    first
        .send(&Request::Start {
            id: "job-1".into(),
            cmd: "read line; exit 5".into(),
            alpine: false,
        })
        .await;
    first.send(&Request::IsRunning { id: "job-1".into() }).await;
    assert!(matches!(first.next_event().await, Event::IsRunning { .. }));
    drop(first);

    let mut second = Client::connect(&daemon.socket, Some("c1")).await;
    second
        .send(&Request::Write {
            id: "job-1".into(),
            input: "go".into(),
        })
        .await;
    assert_eq!(second.wait_exit("job-1").await, 5);
}

#[tokio::test]
async fn other_clients_do_not_see_foreign_events() {
    let daemon = spawn_daemon().await;
    let mut owner = Client::connect(&daemon.socket, Some("owner")).await;
    let mut bystander = Client::connect(&daemon.socket, Some("bystander")).await;

    owner
        .send(&Request::Start {
            id: "job-1".into(),
            cmd: "echo private".into(),
            alpine: false,
        })
        .await;
    assert_eq!(owner.wait_exit("job-1").await, 0);

    bystander.send(&Request::IsRunning { id: "unknown-job".into() }).await;
    assert_eq!(
        bystander.next_event().await,
        Event::IsRunning {
            id: "unknown-job".into(),
            data: shellvisor_proto::RunState::NotFound
        }
    );
}

#[tokio::test]
async fn shutdown_request_stops_server_and_removes_socket() {
    let daemon = spawn_daemon().await;
    let mut client = Client::connect(&daemon.socket, Some("c1")).await;
    client
        .send(&Request::Start {
            id: "job-1".into(),
            cmd: "sleep 100".into(),
            alpine: false,
        })
        .await;
    client.send(&Request::Shutdown).await;

    tokio::time::timeout(EVENT_TIMEOUT, daemon.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(!daemon.socket.exists());
    assert!(daemon.supervisor.registry().is_empty().await);
}

#[tokio::test]
async fn second_server_leaves_live_socket_alone() {
    let daemon = spawn_daemon().await;
    let mut owner = Client::connect(&daemon.socket, Some("c1")).await;
    owner
        .send(&Request::Start {
            id: "job-a".into(),
            cmd: "read line; exit 3".into(),
            alpine: false,
        })
        .await;
    owner.send(&Request::IsRunning { id: "job-a".into() }).await;
    assert!(matches!(owner.next_event().await, Event::IsRunning { .. }));

    let rival = SupervisorServer::new(
        ServerConfig::new(daemon.socket.clone()),
        Supervisor::new(
            &SupervisorConfig::default(),
            Arc::new(ClientTable::new()),
            Host::logging(),
        ),
    );
    let result = tokio::time::timeout(EVENT_TIMEOUT, rival.serve())
        .await
        .expect("second serve did not return");
    assert!(matches!(result, Err(ServerError::AlreadyRunning { .. })));
    assert!(daemon.socket.exists());

    // A fresh connection still reaches the first daemon's job.
    let mut again = Client::connect(&daemon.socket, Some("c1")).await;
    again
        .send(&Request::Write {
            id: "job-a".into(),
            input: "go".into(),
        })
        .await;
    assert_eq!(again.wait_exit("job-a").await, 3);
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let config = SupervisorConfig {
        base_dir: dir.path().to_path_buf(),
        socket_path: Some(socket.clone()),
        ..SupervisorConfig::default()
    };
    let supervisor = Supervisor::new(&config, Arc::new(ClientTable::new()), Host::logging());
    let server = SupervisorServer::new(ServerConfig::from_config(&config), Arc::clone(&supervisor));
    let task = tokio::spawn(async move { server.serve().await });

    wait_for_socket(&socket).await;
    supervisor.shutdown().await;
    tokio::time::timeout(EVENT_TIMEOUT, task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
