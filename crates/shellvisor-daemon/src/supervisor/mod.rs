//! Shell job supervision: spawning, output streaming, exit reporting.

pub mod command;
pub mod manager;
pub mod registry;
pub mod streamer;

pub use command::ShellLauncher;
pub use manager::{ExecOutcome, Supervisor};
pub use registry::{JobEntry, JobRegistry};
pub use streamer::StreamKind;

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Job id already in use: {id}")]
    DuplicateJob { id: String },

    #[error("Failed to start process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Process not found: {id}")]
    JobNotFound { id: String },

    #[error("Process already exited: {id}")]
    JobExited { id: String },

    #[error("Failed to write to process: {reason}")]
    WriteFailed { reason: String },
}
