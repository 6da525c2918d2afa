//! Client-side error types.

use std::time::Duration;

use crate::pending::PendingKind;

/// Failures establishing or using the channel to the supervisor.
///
/// Cloneable so one bind failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Timed out binding to supervisor after {}s", .0.as_secs_f32())]
    BindTimeout(Duration),

    #[error("Failed to connect to supervisor: {0}")]
    ConnectFailed(String),

    #[error("Failed to start supervisor: {0}")]
    AutostartFailed(String),

    #[error("Connection to supervisor lost")]
    Lost,

    #[error("Failed to send request: {0}")]
    SendFailed(String),
}

/// Failures reported by [`crate::Executor`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("A {kind} request for {id} is already in flight")]
    Busy { kind: PendingKind, id: String },

    #[error("Channel lost before a reply arrived")]
    ChannelLost,

    /// The supervisor answered with a failure; carries its message.
    #[error("{0}")]
    Rejected(String),

    #[error("Failed to load library: {0}")]
    Library(String),

    #[error("Executor is shut down")]
    Closed,
}
