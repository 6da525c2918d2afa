//! shellvisor wire protocol
//!
//! Messages exchanged between the supervisor daemon and its clients as
//! newline-delimited JSON over a Unix socket:
//! - [`Request`] flows from a client to the supervisor
//! - [`Event`] flows from the supervisor back to a client
//!
//! Every message is tagged with an `action` field. Job-scoped messages carry
//! the job `id` chosen by the client.

mod codec;

pub use codec::{ProtocolError, decode, encode};

use serde::{Deserialize, Serialize};

/// Opaque, caller-chosen job identifier.
pub type JobId = String;

/// Client-to-supervisor control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    /// Announce the stable identity of the sending client. Sent once per
    /// connection; a reconnecting client reuses its id so that jobs started
    /// earlier route their events to the new connection.
    #[serde(rename_all = "camelCase")]
    Hello { client_id: String },

    /// Spawn `cmd` under `sh -c` and stream its output.
    Start {
        id: JobId,
        cmd: String,
        #[serde(default)]
        alpine: bool,
    },

    /// Append `input` plus a newline to the job's stdin.
    Write { id: JobId, input: String },

    /// Kill the job's process group.
    Stop { id: JobId },

    /// Ask whether the job is still running.
    IsRunning { id: JobId },

    /// Run `cmd` to completion and report a single aggregated result.
    Exec {
        id: JobId,
        cmd: String,
        #[serde(default)]
        alpine: bool,
    },

    /// Flip the keep-awake lock held on behalf of running jobs.
    ToggleKeepAwake,

    /// Kill every job and stop the supervisor.
    Shutdown,
}

impl Request {
    /// Job id this request refers to, if it is job-scoped.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Start { id, .. }
            | Self::Write { id, .. }
            | Self::Stop { id }
            | Self::IsRunning { id }
            | Self::Exec { id, .. } => Some(id),
            Self::Hello { .. } | Self::ToggleKeepAwake | Self::Shutdown => None,
        }
    }
}

/// Point-in-time answer to an `isRunning` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    NotFound,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-to-client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Event {
    /// One line of the job's standard output.
    #[serde(rename = "stdout")]
    Stdout { id: JobId, data: String },

    /// One line of the job's standard error.
    #[serde(rename = "stderr")]
    Stderr { id: JobId, data: String },

    /// The job terminated. Delivered exactly once per registered job unless
    /// the job was stopped.
    #[serde(rename = "exit")]
    Exit { id: JobId, data: i32 },

    /// Reply to [`Request::IsRunning`].
    #[serde(rename = "isRunning")]
    IsRunning { id: JobId, data: RunState },

    /// Reply to [`Request::Exec`].
    #[serde(rename = "exec_result", rename_all = "camelCase")]
    ExecResult {
        id: JobId,
        is_success: bool,
        data: String,
    },

    /// Reply to [`Request::Write`].
    #[serde(rename = "write_result", rename_all = "camelCase")]
    WriteResult {
        id: JobId,
        is_success: bool,
        data: String,
    },

    /// Reply to [`Request::Stop`].
    #[serde(rename = "stop_result", rename_all = "camelCase")]
    StopResult {
        id: JobId,
        is_success: bool,
        data: String,
    },

    /// A request line could not be understood.
    #[serde(rename = "error")]
    Error { data: String },
}

impl Event {
    /// Job id the event belongs to (`None` for connection-level errors).
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Stdout { id, .. }
            | Self::Stderr { id, .. }
            | Self::Exit { id, .. }
            | Self::IsRunning { id, .. }
            | Self::ExecResult { id, .. }
            | Self::WriteResult { id, .. }
            | Self::StopResult { id, .. } => Some(id),
            Self::Error { .. } => None,
        }
    }

    /// Action tag as it appears on the wire.
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::Exit { .. } => "exit",
            Self::IsRunning { .. } => "isRunning",
            Self::ExecResult { .. } => "exec_result",
            Self::WriteResult { .. } => "write_result",
            Self::StopResult { .. } => "stop_result",
            Self::Error { .. } => "error",
        }
    }
}
