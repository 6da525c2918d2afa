//! Pending request table.
//!
//! Tracks requests awaiting supervisor events and hands each event to the
//! caller that is waiting for it. Entries are keyed by `(kind, id)`: a job's
//! output stream and a one-off query about the same job never collide.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use shellvisor_proto::Event;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::BridgeError;

/// What a pending entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// Output and exit of a started job.
    Job,
    /// `write_result`.
    Write,
    /// `stop_result`.
    Stop,
    /// `isRunning`.
    Query,
    /// `exec_result`.
    Exec,
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Job => "job",
            Self::Write => "write",
            Self::Stop => "stop",
            Self::Query => "isRunning",
            Self::Exec => "exec",
        })
    }
}

/// One item of a started job's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Stdout(String),
    Stderr(String),
    Exit(i32),
    /// The channel to the supervisor went away. The job may still be running;
    /// its stream stays open and resumes if the client binds again.
    Disconnected,
}

impl fmt::Display for JobUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout(line) => write!(f, "stdout:{line}"),
            Self::Stderr(line) => write!(f, "stderr:{line}"),
            Self::Exit(code) => write!(f, "exit:{code}"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Outcome delivered to a one-shot caller.
pub type Reply = Result<String, BridgeError>;

enum Slot {
    Job(mpsc::UnboundedSender<JobUpdate>),
    Reply(oneshot::Sender<Reply>),
}

impl Slot {
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Job(tx) => tx.is_closed(),
            Self::Reply(tx) => tx.is_closed(),
        }
    }
}

type Key = (PendingKind, String);

/// Requests awaiting events from the supervisor.
#[derive(Default)]
pub struct PendingTable {
    slots: Arc<RwLock<HashMap<Key, Slot>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, kind: PendingKind, id: &str, slot: Slot) -> Result<(), BridgeError> {
        let mut slots = self.slots.write().await;
        let key = (kind, id.to_string());
        if slots.get(&key).is_some_and(|existing| !existing.is_abandoned()) {
            return Err(BridgeError::Busy {
                kind,
                id: id.to_string(),
            });
        }
        slots.insert(key, slot);
        Ok(())
    }

    /// Register a job stream. Items arrive until exit, a successful stop, or
    /// [`PendingTable::close_all`].
    pub async fn register_job(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<JobUpdate>, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(PendingKind::Job, id, Slot::Job(tx)).await?;
        debug!(job_id = id, "Registered job stream");
        Ok(rx)
    }

    /// Register a one-shot reply.
    pub async fn register_reply(
        &self,
        kind: PendingKind,
        id: &str,
    ) -> Result<oneshot::Receiver<Reply>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.insert(kind, id, Slot::Reply(tx)).await?;
        Ok(rx)
    }

    /// Forget an entry without delivering anything.
    pub async fn cancel(&self, kind: PendingKind, id: &str) {
        self.slots.write().await.remove(&(kind, id.to_string()));
    }

    pub async fn contains(&self, kind: PendingKind, id: &str) -> bool {
        self.slots
            .read()
            .await
            .contains_key(&(kind, id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Deliver one supervisor event.
    pub async fn route(&self, event: Event) {
        match event {
            Event::Stdout { id, data } => self.push(&id, JobUpdate::Stdout(data)).await,
            Event::Stderr { id, data } => self.push(&id, JobUpdate::Stderr(data)).await,
            Event::Exit { id, data } => {
                let slot = self.take(PendingKind::Job, &id).await;
                if let Some(Slot::Job(tx)) = slot {
                    let _ = tx.send(JobUpdate::Exit(data));
                } else {
                    debug!(job_id = %id, code = data, "Exit for untracked job");
                }
            }
            Event::IsRunning { id, data } => {
                self.reply(PendingKind::Query, &id, Ok(data.as_str().to_string()))
                    .await;
            }
            Event::ExecResult {
                id,
                is_success,
                data,
            } => self.reply(PendingKind::Exec, &id, outcome(is_success, data)).await,
            Event::WriteResult {
                id,
                is_success,
                data,
            } => {
                self.reply(PendingKind::Write, &id, outcome(is_success, data))
                    .await;
            }
            Event::StopResult {
                id,
                is_success,
                data,
            } => {
                if is_success {
                    // A stopped job produces no further events.
                    self.take(PendingKind::Job, &id).await;
                }
                self.reply(PendingKind::Stop, &id, outcome(is_success, data))
                    .await;
            }
            Event::Error { data } => warn!(error = %data, "Supervisor reported an error"),
        }
    }

    /// Fail every one-shot entry with `error`. Job streams stay registered.
    pub async fn fail_replies(&self, error: &BridgeError) {
        let failed: Vec<Slot> = {
            let mut slots = self.slots.write().await;
            let keys: Vec<Key> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Reply(_)))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| slots.remove(key)).collect()
        };
        if !failed.is_empty() {
            debug!(count = failed.len(), error = %error, "Failing pending replies");
        }
        for slot in failed {
            if let Slot::Reply(tx) = slot {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Push [`JobUpdate::Disconnected`] into every open job stream. The
    /// streams stay registered.
    pub async fn notify_streams_lost(&self) {
        let mut notified = 0usize;
        for slot in self.slots.read().await.values() {
            if let Slot::Job(tx) = slot
                && tx.send(JobUpdate::Disconnected).is_ok()
            {
                notified += 1;
            }
        }
        if notified > 0 {
            debug!(count = notified, "Told job streams about channel loss");
        }
    }

    /// Drop every entry. Job streams end; replies fail with
    /// [`BridgeError::Closed`].
    pub async fn close_all(&self) {
        let drained: Vec<Slot> = self.slots.write().await.drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            if let Slot::Reply(tx) = slot {
                let _ = tx.send(Err(BridgeError::Closed));
            }
        }
    }

    async fn push(&self, id: &str, update: JobUpdate) {
        let delivered = match self.slots.read().await.get(&(PendingKind::Job, id.to_string())) {
            Some(Slot::Job(tx)) => tx.send(update).is_ok(),
            _ => {
                debug!(job_id = id, "Output for untracked job");
                return;
            }
        };
        if !delivered {
            debug!(job_id = id, "Job stream receiver gone, forgetting job");
            self.cancel(PendingKind::Job, id).await;
        }
    }

    async fn take(&self, kind: PendingKind, id: &str) -> Option<Slot> {
        self.slots.write().await.remove(&(kind, id.to_string()))
    }

    async fn reply(&self, kind: PendingKind, id: &str, reply: Reply) {
        match self.take(kind, id).await {
            Some(Slot::Reply(tx)) => {
                let _ = tx.send(reply);
            }
            _ => debug!(job_id = id, %kind, "Reply with no waiting caller"),
        }
    }
}

fn outcome(is_success: bool, data: String) -> Reply {
    if is_success {
        Ok(data)
    } else {
        Err(BridgeError::Rejected(data))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use shellvisor_proto::RunState;

    #[test]
    fn updates_render_as_tagged_text() {
        assert_eq!(JobUpdate::Stdout("hi".into()).to_string(), "stdout:hi");
        assert_eq!(JobUpdate::Stderr("oops".into()).to_string(), "stderr:oops");
        assert_eq!(JobUpdate::Exit(3).to_string(), "exit:3");
        assert_eq!(JobUpdate::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn job_stream_ends_after_exit() {
        let table = PendingTable::new();
        let mut rx = table.register_job("j1").await.unwrap();

        table
            .route(Event::Stdout {
                id: "j1".into(),
                data: "line".into(),
            })
            .await;
        table
            .route(Event::Exit {
                id: "j1".into(),
                data: 0,
            })
            .await;

        assert_eq!(rx.recv().await, Some(JobUpdate::Stdout("line".into())));
        assert_eq!(rx.recv().await, Some(JobUpdate::Exit(0)));
        assert_eq!(rx.recv().await, None);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn query_does_not_displace_job_stream() {
        let table = PendingTable::new();
        let _stream = table.register_job("j1").await.unwrap();
        let query = table.register_reply(PendingKind::Query, "j1").await.unwrap();

        table
            .route(Event::IsRunning {
                id: "j1".into(),
                data: RunState::Running,
            })
            .await;

        assert_eq!(query.await.unwrap(), Ok("running".into()));
        assert!(table.contains(PendingKind::Job, "j1").await);
    }

    #[tokio::test]
    async fn second_request_of_same_kind_is_busy() {
        let table = PendingTable::new();
        let _first = table.register_reply(PendingKind::Write, "j1").await.unwrap();
        let second = table.register_reply(PendingKind::Write, "j1").await;
        assert!(matches!(second, Err(BridgeError::Busy { .. })));
    }

    #[tokio::test]
    async fn abandoned_entry_can_be_reused() {
        let table = PendingTable::new();
        drop(table.register_job("j1").await.unwrap());
        assert!(table.register_job("j1").await.is_ok());
    }

    #[tokio::test]
    async fn failed_result_is_rejected() {
        let table = PendingTable::new();
        let exec = table.register_reply(PendingKind::Exec, "e1").await.unwrap();
        table
            .route(Event::ExecResult {
                id: "e1".into(),
                is_success: false,
                data: "Command exited with code: 7".into(),
            })
            .await;
        assert_eq!(
            exec.await.unwrap(),
            Err(BridgeError::Rejected("Command exited with code: 7".into()))
        );
    }

    #[tokio::test]
    async fn successful_stop_closes_job_stream() {
        let table = PendingTable::new();
        let mut stream = table.register_job("j1").await.unwrap();
        let stop = table.register_reply(PendingKind::Stop, "j1").await.unwrap();

        table
            .route(Event::StopResult {
                id: "j1".into(),
                is_success: true,
                data: "Process terminated".into(),
            })
            .await;

        assert_eq!(stop.await.unwrap(), Ok("Process terminated".into()));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn channel_loss_fails_replies_but_keeps_streams() {
        let table = PendingTable::new();
        let mut stream = table.register_job("j1").await.unwrap();
        let write = table.register_reply(PendingKind::Write, "j1").await.unwrap();

        table.fail_replies(&BridgeError::ChannelLost).await;
        assert_eq!(write.await.unwrap(), Err(BridgeError::ChannelLost));

        table
            .route(Event::Exit {
                id: "j1".into(),
                data: 2,
            })
            .await;
        assert_eq!(stream.recv().await, Some(JobUpdate::Exit(2)));
    }

    #[tokio::test]
    async fn stream_learns_of_loss_and_still_gets_exit() {
        let table = PendingTable::new();
        let mut stream = table.register_job("j1").await.unwrap();
        let _query = table.register_reply(PendingKind::Query, "j1").await.unwrap();

        table.notify_streams_lost().await;
        assert_eq!(stream.recv().await, Some(JobUpdate::Disconnected));
        assert!(table.contains(PendingKind::Job, "j1").await);

        table
            .route(Event::Exit {
                id: "j1".into(),
                data: 0,
            })
            .await;
        assert_eq!(stream.recv().await, Some(JobUpdate::Exit(0)));
    }

    #[tokio::test]
    async fn close_all_ends_everything() {
        let table = PendingTable::new();
        let mut stream = table.register_job("j1").await.unwrap();
        let query = table.register_reply(PendingKind::Query, "j1").await.unwrap();

        table.close_all().await;

        assert_eq!(stream.recv().await, None);
        assert_eq!(query.await.unwrap(), Err(BridgeError::Closed));
        assert!(table.is_empty().await);
    }
}
