//! RPC wire protocol
//!
//! Calls travel as 4-byte length-delimited frames carrying one JSON
//! object each; one request frame yields exactly one reply frame. The
//! debug trace buffers inside replies stay opaque bytes end-to-end.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::RpcError;
use crate::core::control::{LogMessage, PlcStatus, PskIdentity, TraceOrder, TraceSample, LOG_LEVELS};

/// A remote call to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Start the loaded program
    StartPlc,
    /// Stop the running program
    StopPlc,
    /// Query run state and log counts
    GetStatus,
    /// Check whether the loaded program matches a digest
    MatchMd5 {
        /// Expected program digest
        digest: String,
    },
    /// Install a new program image
    NewPlc {
        /// Digest of the image
        digest: String,
        /// The image itself
        object: Vec<u8>,
    },
    /// Replace the traced variable set
    SetTraceVariables {
        /// Subscription orders, in trace-buffer order
        orders: Vec<TraceOrder>,
    },
    /// Drain queued trace samples
    GetTraceVariables,
    /// Execute a script in the controller environment
    RemoteExec {
        /// Script source
        script: String,
    },
    /// Query the controller's self-reported identity
    GetPlcId,
    /// Fetch one runtime log message
    GetLogMessage {
        /// Severity level (0..4)
        level: u8,
        /// Message index within the level
        msgid: u32,
    },
    /// Clear the runtime log rings
    ResetLogCount,
}

/// Reply to one [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Operation outcome for calls without a payload
    Bool {
        /// Whether the operation succeeded
        value: bool,
    },
    /// Run state and per-level log counts
    Status {
        /// Controller run state
        status: PlcStatus,
        /// Log message count per severity level
        log_counts: [u32; LOG_LEVELS],
    },
    /// Drained trace samples
    Trace {
        /// Controller run state at drain time
        status: PlcStatus,
        /// Captured debug buffers, oldest first
        samples: Vec<TraceSample>,
    },
    /// Script execution outcome
    ExecResult {
        /// Process exit code
        code: i32,
        /// Combined captured output
        output: String,
    },
    /// Self-reported identity, if the controller has one
    PlcId {
        /// ID and pre-shared secret
        identity: Option<PskIdentity>,
    },
    /// One runtime log message, if present
    Log {
        /// The message, or none past the end of the ring
        message: Option<LogMessage>,
    },
    /// Semantic failure of the operation itself
    Error {
        /// Failure description
        message: String,
    },
}

/// Serialize a request into one frame payload
///
/// # Errors
///
/// [`RpcError::Protocol`] when serialization fails.
pub fn encode_request(request: &Request) -> Result<Bytes, RpcError> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|e| RpcError::Protocol(e.to_string()))
}

/// Parse one frame payload into a request
///
/// # Errors
///
/// [`RpcError::Protocol`] on malformed frames.
pub fn decode_request(frame: &[u8]) -> Result<Request, RpcError> {
    serde_json::from_slice(frame).map_err(|e| RpcError::Protocol(e.to_string()))
}

/// Serialize a reply into one frame payload
///
/// # Errors
///
/// [`RpcError::Protocol`] when serialization fails.
pub fn encode_reply(reply: &Reply) -> Result<Bytes, RpcError> {
    serde_json::to_vec(reply)
        .map(Bytes::from)
        .map_err(|e| RpcError::Protocol(e.to_string()))
}

/// Parse one frame payload into a reply
///
/// # Errors
///
/// [`RpcError::Protocol`] on malformed frames.
pub fn decode_reply(frame: &[u8]) -> Result<Reply, RpcError> {
    serde_json::from_slice(frame).map_err(|e| RpcError::Protocol(e.to_string()))
}
