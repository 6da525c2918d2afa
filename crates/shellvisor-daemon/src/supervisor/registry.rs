//! Job registry.
//!
//! Maps job id to the supervisor-owned handles of a live process. Lifecycle:
//! an entry is inserted in the same critical section as the spawn, and
//! removed exactly once, by whichever of exit, stop, or shutdown gets there
//! first. The winner of [`JobRegistry::remove`] is the only party allowed to
//! report the job's end.

use std::collections::HashMap;
use std::io;

use shellvisor_proto::{JobId, RunState};
use tokio::sync::{RwLock, mpsc, oneshot, watch};

use super::SupervisorError;

/// One queued stdin write and the channel its outcome is reported on.
#[derive(Debug)]
pub struct StdinWrite {
    pub text: String,
    pub reply: oneshot::Sender<io::Result<()>>,
}

/// Supervisor-side state of a live job.
#[derive(Debug)]
pub struct JobEntry {
    client_id: String,
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<StdinWrite>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl JobEntry {
    pub const fn new(
        client_id: String,
        pid: Option<u32>,
        stdin_tx: mpsc::UnboundedSender<StdinWrite>,
        exit_rx: watch::Receiver<Option<i32>>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            client_id,
            pid,
            stdin_tx,
            exit_rx,
            kill_tx: Some(kill_tx),
        }
    }

    /// Client the job reports to.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// OS process id of the job's shell, which is also its process group id.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has produced an exit status.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Ask the exit watcher to force-kill and reap the child.
    ///
    /// Dropping the entry has the same effect; this just makes it explicit.
    pub fn destroy(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Concurrent job id → [`JobEntry`] map.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and register a job atomically.
    ///
    /// `spawn` runs while the registry is locked, so no other task can observe
    /// or claim `id` between the duplicate check and the insert. It is not
    /// called at all when `id` is already live.
    pub async fn insert_with<T>(
        &self,
        id: &str,
        spawn: impl FnOnce() -> Result<(JobEntry, T), SupervisorError>,
    ) -> Result<T, SupervisorError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(id) {
            return Err(SupervisorError::DuplicateJob { id: id.to_string() });
        }
        let (entry, extra) = spawn()?;
        jobs.insert(id.to_string(), entry);
        Ok(extra)
    }

    /// Remove a job. Returns `None` if another party already removed it.
    pub async fn remove(&self, id: &str) -> Option<JobEntry> {
        self.jobs.write().await.remove(id)
    }

    /// Stdin queue of a live job.
    pub async fn stdin(&self, id: &str) -> Option<mpsc::UnboundedSender<StdinWrite>> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|entry| entry.stdin_tx.clone())
    }

    /// Point-in-time run state of `id`.
    pub async fn run_state(&self, id: &str) -> RunState {
        match self.jobs.read().await.get(id) {
            Some(entry) if !entry.has_exited() => RunState::Running,
            _ => RunState::NotFound,
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.jobs.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Remove and return every live job.
    pub async fn drain(&self) -> Vec<(JobId, JobEntry)> {
        self.jobs.write().await.drain().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Handles {
        exit_tx: watch::Sender<Option<i32>>,
        kill_rx: oneshot::Receiver<()>,
        _stdin_rx: mpsc::UnboundedReceiver<StdinWrite>,
    }

    fn entry(client_id: &str) -> (JobEntry, Handles) {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        (
            JobEntry::new(client_id.into(), Some(42), stdin_tx, exit_rx, kill_tx),
            Handles {
                exit_tx,
                kill_rx,
                _stdin_rx: stdin_rx,
            },
        )
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = JobRegistry::new();
        assert_eq!(registry.run_state("nope").await, RunState::NotFound);
        assert!(registry.stdin("nope").await.is_none());
    }

    #[tokio::test]
    async fn registered_job_runs_until_exit_status() {
        let registry = JobRegistry::new();
        let handles = registry
            .insert_with("j1", || Ok(entry("c1")))
            .await
            .unwrap();

        assert_eq!(registry.run_state("j1").await, RunState::Running);
        handles.exit_tx.send(Some(0)).unwrap();
        assert_eq!(registry.run_state("j1").await, RunState::NotFound);
        assert!(registry.contains("j1").await);
    }

    #[tokio::test]
    async fn duplicate_id_skips_spawn() {
        let registry = JobRegistry::new();
        let _handles = registry
            .insert_with("j1", || Ok(entry("c1")))
            .await
            .unwrap();

        let mut spawned = false;
        let result = registry
            .insert_with("j1", || {
                spawned = true;
                Ok(entry("c2"))
            })
            .await;

        assert!(matches!(result, Err(SupervisorError::DuplicateJob { .. })));
        assert!(!spawned);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn failed_spawn_leaves_no_entry() {
        let registry = JobRegistry::new();
        let result: Result<(), _> = registry
            .insert_with("j1", || {
                Err(SupervisorError::SpawnFailed {
                    reason: "no shell".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_happens_once() {
        let registry = JobRegistry::new();
        let _handles = registry
            .insert_with("j1", || Ok(entry("c1")))
            .await
            .unwrap();

        let removed = registry.remove("j1").await.unwrap();
        assert_eq!(removed.client_id(), "c1");
        assert_eq!(removed.pid(), Some(42));
        assert!(registry.remove("j1").await.is_none());
    }

    #[tokio::test]
    async fn destroy_signals_exit_watcher() {
        let registry = JobRegistry::new();
        let handles = registry
            .insert_with("j1", || Ok(entry("c1")))
            .await
            .unwrap();

        registry.remove("j1").await.unwrap().destroy();
        assert!(handles.kill_rx.await.is_ok());
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let registry = JobRegistry::new();
        let _a = registry.insert_with("a", || Ok(entry("c"))).await.unwrap();
        let _b = registry.insert_with("b", || Ok(entry("c"))).await.unwrap();

        let mut ids: Vec<_> = registry.drain().await.into_iter().map(|(id, _)| id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.is_empty().await);
    }
}
