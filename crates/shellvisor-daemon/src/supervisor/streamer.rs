//! Output streamer: one reader task per job output stream.

use std::sync::Arc;

use shellvisor_proto::{Event, JobId};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clients::ClientTable;

/// Which of the job's output streams a reader is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn event(self, id: JobId, data: String) -> Event {
        match self {
            Self::Stdout => Event::Stdout { id, data },
            Self::Stderr => Event::Stderr { id, data },
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Decode one raw line: lossy UTF-8, without its `\n` or `\r\n` terminator.
pub fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Forward every line of `reader` to the job's client as it is produced.
///
/// The task ends when the stream reaches end-of-input or a read fails; both
/// are the normal end of a job's output.
pub fn spawn_streamer<R>(
    reader: R,
    kind: StreamKind,
    job_id: JobId,
    client_id: String,
    clients: Arc<ClientTable>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    debug!(job_id = %job_id, stream = kind.name(), "{}", line);
                    clients
                        .send(&client_id, kind.event(job_id.clone(), line))
                        .await;
                }
                Err(e) => {
                    debug!(job_id = %job_id, stream = kind.name(), error = %e, "Read failed");
                    break;
                }
            }
        }
        debug!(job_id = %job_id, stream = kind.name(), "Stream reader finished");
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn decode_strips_terminators() {
        assert_eq!(decode_line(b"hello\n"), "hello");
        assert_eq!(decode_line(b"dos\r\n"), "dos");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn lines_are_forwarded_in_order() {
        let clients = Arc::new(ClientTable::new());
        let (tx, mut rx) = mpsc::channel(16);
        clients.attach("c1", clients.next_connection_id(), tx).await;

        let input: &[u8] = b"one\ntwo\r\nthree";
        spawn_streamer(input, StreamKind::Stderr, "j1".into(), "c1".into(), clients)
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Stderr { id, data } => {
                    assert_eq!(id, "j1");
                    lines.push(data);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn detached_client_does_not_stop_reader() {
        let clients = Arc::new(ClientTable::new());
        let input: &[u8] = b"lost\nlines\n";
        spawn_streamer(input, StreamKind::Stdout, "j1".into(), "gone".into(), clients)
            .await
            .unwrap();
    }
}
