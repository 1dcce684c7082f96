//! graylag policy daemon: greylisting over the SMTPD access-policy
//! delegation protocol.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for serving operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// The per-request greylisting decision state machine.
pub mod policy;
/// Whitelist rebuild and atomic publication.
pub mod reload;
/// Listener, accept loop and shared server state.
pub mod server;
/// Periodic expiry of stale store entries.
pub mod sweeper;

pub use server::{run, Listener, ServerState};
