//! RPC session layer
//!
//! Connects remote front-ends to the controller operation set:
//! - `proto`: length-delimited JSON wire frames
//! - `server`: accept loop with restart/stop lifecycle and idle reaping
//! - `client`: connector with typed per-operation safe defaults
//!
//! Transport failures are always recoverable at this layer: they are
//! surfaced per call (or absorbed into safe defaults on the client
//! side), never allowed to corrupt session state.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{connect, Connector, PlcProxy};
pub use proto::{Reply, Request};
pub use server::{RpcServer, ServerConfig, ServerHandle};

use thiserror::Error;

/// RPC error types
#[derive(Error, Debug)]
pub enum RpcError {
    /// The transport dropped mid-call; reconnect and retry
    #[error("connection lost")]
    ConnectionLost,

    /// The endpoint could not be reached or bound
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection URI could not be parsed
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
