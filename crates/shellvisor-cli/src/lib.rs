//! shellvisor client library
//!
//! Client side of the supervisor protocol:
//! - Connection binding state machine with single-flight binds and timeouts
//! - Unix socket connector that can auto-start the daemon
//! - Pending request table routing events back to their callers
//! - [`Executor`], the action façade used by the `shellvisor` binary

pub mod binding;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod library;
pub mod pending;

pub use binding::{Binder, ConnectionState, Connector, LossHandle};
pub use bridge::{Executor, ExecutorConfig, JobHandle};
pub use error::{BridgeError, ConnectionError};
pub use pending::{JobUpdate, PendingKind};
