//! Host collaborators.
//!
//! The supervisor does not own a UI or any power management. It reports its
//! state to a [`StatusNotifier`] and holds a keep-awake lock through a
//! [`KeepAwake`]; embedders plug real implementations in through [`Host::new`].
//! The defaults only log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Status line shown while the supervisor runs.
pub const STATUS_TEXT: &str = "Executor service";
/// Suffix appended while the keep-awake lock is held.
pub const KEEP_AWAKE_SUFFIX: &str = " (wakelock held)";

/// Actions the status surface offers to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusAction {
    /// Stop the supervisor and every job.
    Exit,
    /// Flip the keep-awake lock. Carries the label to display.
    ToggleKeepAwake { label: &'static str },
}

/// Snapshot handed to the [`StatusNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub text: String,
    pub keep_awake_held: bool,
    pub actions: Vec<StatusAction>,
}

impl ServiceStatus {
    pub fn new(keep_awake_held: bool) -> Self {
        let mut text = STATUS_TEXT.to_string();
        if keep_awake_held {
            text.push_str(KEEP_AWAKE_SUFFIX);
        }
        let label = if keep_awake_held {
            "Release Wake Lock"
        } else {
            "Acquire Wake Lock"
        };
        Self {
            text,
            keep_awake_held,
            actions: vec![StatusAction::Exit, StatusAction::ToggleKeepAwake { label }],
        }
    }
}

/// Persistent status display.
pub trait StatusNotifier: Send + Sync {
    fn show(&self, status: &ServiceStatus);
    fn clear(&self);
}

/// Power-saving lock held on behalf of running jobs.
pub trait KeepAwake: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// [`StatusNotifier`] that writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn show(&self, status: &ServiceStatus) {
        info!(status = %status.text, keep_awake = status.keep_awake_held, "Service status");
    }

    fn clear(&self) {
        info!("Service status cleared");
    }
}

/// [`KeepAwake`] that only records transitions in the log.
#[derive(Debug, Default)]
pub struct LogKeepAwake;

impl KeepAwake for LogKeepAwake {
    fn acquire(&self) {
        info!("Keep-awake lock acquired");
    }

    fn release(&self) {
        info!("Keep-awake lock released");
    }
}

/// Supervisor-side view of the host collaborators plus the lock state.
pub struct Host {
    notifier: Arc<dyn StatusNotifier>,
    keep_awake: Arc<dyn KeepAwake>,
    held: AtomicBool,
}

impl Host {
    pub fn new(notifier: Arc<dyn StatusNotifier>, keep_awake: Arc<dyn KeepAwake>) -> Self {
        Self {
            notifier,
            keep_awake,
            held: AtomicBool::new(false),
        }
    }

    /// Host backed by the logging collaborators.
    pub fn logging() -> Self {
        Self::new(Arc::new(LogNotifier), Arc::new(LogKeepAwake))
    }

    pub fn keep_awake_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Show the current status.
    pub fn publish(&self) {
        self.notifier.show(&ServiceStatus::new(self.keep_awake_held()));
    }

    /// Flip the keep-awake lock and refresh the status. Returns the new state.
    pub fn toggle_keep_awake(&self) -> bool {
        let held = !self.held.fetch_xor(true, Ordering::SeqCst);
        if held {
            self.keep_awake.acquire();
        } else {
            self.keep_awake.release();
        }
        self.notifier.show(&ServiceStatus::new(held));
        held
    }

    /// Release the lock if held and clear the status.
    pub fn shutdown(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.keep_awake.release();
        }
        self.notifier.clear();
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::logging()
    }
}
