//! shellvisor daemon library
//!
//! Core functionality for the supervisor daemon:
//! - Job registry, output streaming and exit reporting for shell jobs
//! - Client table routing events to each client's current connection
//! - Host collaborator traits for status display and keep-awake
//! - Unix socket server speaking the NDJSON protocol

pub mod clients;
pub mod host;
pub mod server;
pub mod supervisor;
