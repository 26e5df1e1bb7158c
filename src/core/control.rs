//! Controller operation surface
//!
//! [`ControlTarget`] enumerates the operations a controller exposes to
//! remote front-ends; every call reaching it is already serialized onto
//! the worker thread. [`LocalRuntime`] is the in-process implementation
//! backing the service daemon: program lifecycle state, the live trace
//! queue, the runtime log rings, and the controller's own identity.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::process::Command;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Number of runtime log severity levels (critical, warning, info, debug)
pub const LOG_LEVELS: usize = 4;

/// Trace samples retained when nobody is draining them
const TRACE_QUEUE_MAX: usize = 1024;

/// Log messages retained per level
const LOG_RING_MAX: usize = 4096;

/// Controller operation errors (semantic failures, not transport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No program image has been loaded
    #[error("no program loaded")]
    NoProgram,

    /// The operation is not allowed in the controller's current state
    #[error("controller is {0}, operation not allowed")]
    InvalidState(PlcStatus),
}

/// Controller run state as reported to front-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlcStatus {
    /// No program loaded
    #[default]
    Empty,
    /// Program loaded but not running
    Stopped,
    /// Program running
    Started,
    /// Controller unusable (also the safe default on lost connections)
    Broken,
    /// No controller reachable
    Disconnected,
}

impl fmt::Display for PlcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Started => write!(f, "Started"),
            Self::Broken => write!(f, "Broken"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// A controller's self-reported identity: ID plus pre-shared secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskIdentity {
    /// Opaque identifier, unique per controller instance
    pub id: String,
    /// Pre-shared secret authenticating front-ends to this controller
    pub secret: String,
}

/// One drained debug buffer with the controller tick it was captured at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSample {
    /// Controller cycle counter at capture time
    pub tick: u32,
    /// Opaque debug buffer; decode with the codec and the trace tag list
    pub buffer: Vec<u8>,
}

/// Subscription order for one traced variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOrder {
    /// Variable index in the controller's debug table
    pub index: u32,
    /// Wire-encoded value to force, if any (see codec `encode_value`)
    pub force: Option<Vec<u8>>,
}

/// One runtime log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Capture timestamp, preformatted
    pub timestamp: String,
    /// Message text
    pub message: String,
}

/// The controller's externally exposed operation set
///
/// Implementations are called from the worker thread only; the RPC layer
/// routes every inbound call through the worker to guarantee that.
#[cfg_attr(test, mockall::automock)]
pub trait ControlTarget: Send + Sync {
    /// Start the loaded program
    ///
    /// # Errors
    ///
    /// [`ControlError::NoProgram`] when nothing is loaded,
    /// [`ControlError::InvalidState`] when already running or broken.
    fn start_plc(&self) -> Result<(), ControlError>;

    /// Stop the running program
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidState`] when not running.
    fn stop_plc(&self) -> Result<(), ControlError>;

    /// Current run state plus per-level log message counts
    fn status(&self) -> (PlcStatus, [u32; LOG_LEVELS]);

    /// Whether the loaded program matches the given digest
    fn match_md5(&self, digest: &str) -> bool;

    /// Install a new program image, replacing any loaded one
    ///
    /// # Errors
    ///
    /// [`ControlError::InvalidState`] while a program is running.
    fn new_plc(&self, digest: &str, object: &[u8]) -> Result<(), ControlError>;

    /// Replace the set of traced variables (with optional forced values)
    ///
    /// # Errors
    ///
    /// [`ControlError::NoProgram`] when nothing is loaded.
    fn set_trace_variables(&self, orders: Vec<TraceOrder>) -> Result<(), ControlError>;

    /// Drain queued trace samples
    fn get_trace_variables(&self) -> (PlcStatus, Vec<TraceSample>);

    /// Execute a script in the controller environment, capturing output
    fn remote_exec(&self, script: &str) -> (i32, String);

    /// The controller's self-reported identity, if it has one
    fn identity(&self) -> Option<PskIdentity>;

    /// Fetch one log message by level and index
    fn get_log_message(&self, level: u8, msgid: u32) -> Option<LogMessage>;

    /// Clear all log rings
    fn reset_log_count(&self);
}

struct RuntimeState {
    status: PlcStatus,
    program_md5: Option<String>,
    trace_orders: Vec<TraceOrder>,
    trace_queue: VecDeque<TraceSample>,
    logs: [Vec<LogMessage>; LOG_LEVELS],
}

/// In-process controller runtime
///
/// Minimal boundary implementation used by the service daemon and the
/// tests: it keeps the lifecycle state machine, the trace queue, and the
/// log rings, without any program execution engine behind them.
pub struct LocalRuntime {
    identity: PskIdentity,
    state: Mutex<RuntimeState>,
}

impl LocalRuntime {
    /// Create a runtime with a freshly generated identity
    pub fn new() -> Self {
        let mut secret = [0u8; 24];
        rand::thread_rng().fill(&mut secret[..]);
        Self::with_identity(PskIdentity {
            id: Uuid::new_v4().to_string(),
            secret: BASE64.encode(secret),
        })
    }

    /// Create a runtime with a fixed identity
    pub fn with_identity(identity: PskIdentity) -> Self {
        Self {
            identity,
            state: Mutex::new(RuntimeState {
                status: PlcStatus::Empty,
                program_md5: None,
                trace_orders: Vec::new(),
                trace_queue: VecDeque::new(),
                logs: std::array::from_fn(|_| Vec::new()),
            }),
        }
    }

    /// Queue one captured debug buffer for the next trace drain
    ///
    /// Oldest samples are discarded once the queue is full.
    pub fn push_trace_sample(&self, tick: u32, buffer: Vec<u8>) {
        let mut state = self.state.lock();
        if state.trace_queue.len() >= TRACE_QUEUE_MAX {
            state.trace_queue.pop_front();
        }
        state.trace_queue.push_back(TraceSample { tick, buffer });
    }

    /// Append a message to one log ring
    pub fn log_message(&self, level: usize, message: &str) {
        if level >= LOG_LEVELS {
            return;
        }
        let mut state = self.state.lock();
        let ring = &mut state.logs[level];
        if ring.len() >= LOG_RING_MAX {
            ring.remove(0);
        }
        ring.push(LogMessage {
            timestamp: chrono::Local::now().format("%y/%m/%d-%H:%M:%S").to_string(),
            message: message.to_string(),
        });
    }

    /// Currently subscribed trace orders
    pub fn trace_orders(&self) -> Vec<TraceOrder> {
        self.state.lock().trace_orders.clone()
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlTarget for LocalRuntime {
    fn start_plc(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        match state.status {
            PlcStatus::Stopped => {
                state.status = PlcStatus::Started;
                info!("program started");
                Ok(())
            }
            PlcStatus::Empty => Err(ControlError::NoProgram),
            other => Err(ControlError::InvalidState(other)),
        }
    }

    fn stop_plc(&self) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        match state.status {
            PlcStatus::Started => {
                state.status = PlcStatus::Stopped;
                info!("program stopped");
                Ok(())
            }
            other => Err(ControlError::InvalidState(other)),
        }
    }

    fn status(&self) -> (PlcStatus, [u32; LOG_LEVELS]) {
        let state = self.state.lock();
        let mut counts = [0u32; LOG_LEVELS];
        for (count, ring) in counts.iter_mut().zip(state.logs.iter()) {
            *count = u32::try_from(ring.len()).unwrap_or(u32::MAX);
        }
        (state.status, counts)
    }

    fn match_md5(&self, digest: &str) -> bool {
        self.state.lock().program_md5.as_deref() == Some(digest)
    }

    fn new_plc(&self, digest: &str, object: &[u8]) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if state.status == PlcStatus::Started {
            return Err(ControlError::InvalidState(PlcStatus::Started));
        }
        state.program_md5 = Some(digest.to_string());
        state.trace_orders.clear();
        state.trace_queue.clear();
        state.status = PlcStatus::Stopped;
        info!(bytes = object.len(), md5 = digest, "program image installed");
        Ok(())
    }

    fn set_trace_variables(&self, orders: Vec<TraceOrder>) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if state.program_md5.is_none() {
            return Err(ControlError::NoProgram);
        }
        state.trace_orders = orders;
        state.trace_queue.clear();
        Ok(())
    }

    fn get_trace_variables(&self) -> (PlcStatus, Vec<TraceSample>) {
        let mut state = self.state.lock();
        let samples = state.trace_queue.drain(..).collect();
        (state.status, samples)
    }

    fn remote_exec(&self, script: &str) -> (i32, String) {
        #[cfg(windows)]
        let output = Command::new("cmd").arg("/C").arg(script).output();
        #[cfg(not(windows))]
        let output = Command::new("sh").arg("-c").arg(script).output();

        match output {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.code().unwrap_or(-1), text)
            }
            Err(e) => (-1, format!("script execution failed: {e}")),
        }
    }

    fn identity(&self) -> Option<PskIdentity> {
        Some(self.identity.clone())
    }

    fn get_log_message(&self, level: u8, msgid: u32) -> Option<LogMessage> {
        let state = self.state.lock();
        state
            .logs
            .get(level as usize)
            .and_then(|ring| ring.get(msgid as usize))
            .cloned()
    }

    fn reset_log_count(&self) {
        let mut state = self.state.lock();
        for ring in &mut state.logs {
            ring.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_state_machine() {
        let runtime = LocalRuntime::new();
        assert_eq!(runtime.status().0, PlcStatus::Empty);
        assert_eq!(runtime.start_plc(), Err(ControlError::NoProgram));

        runtime.new_plc("d41d8cd9", b"object code").unwrap();
        assert_eq!(runtime.status().0, PlcStatus::Stopped);
        assert!(runtime.match_md5("d41d8cd9"));
        assert!(!runtime.match_md5("other"));

        runtime.start_plc().unwrap();
        assert_eq!(runtime.status().0, PlcStatus::Started);
        assert_eq!(
            runtime.new_plc("ffff", b""),
            Err(ControlError::InvalidState(PlcStatus::Started))
        );

        runtime.stop_plc().unwrap();
        assert_eq!(runtime.status().0, PlcStatus::Stopped);
        assert_eq!(
            runtime.stop_plc(),
            Err(ControlError::InvalidState(PlcStatus::Stopped))
        );
    }

    #[test]
    fn test_trace_queue_drains() {
        let runtime = LocalRuntime::new();
        runtime.new_plc("md5", b"obj").unwrap();
        runtime
            .set_trace_variables(vec![TraceOrder {
                index: 0,
                force: None,
            }])
            .unwrap();
        runtime.push_trace_sample(1, vec![0x01]);
        runtime.push_trace_sample(2, vec![0x00]);

        let (_, samples) = runtime.get_trace_variables();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].tick, 1);

        let (_, samples) = runtime.get_trace_variables();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_log_rings() {
        let runtime = LocalRuntime::new();
        runtime.log_message(1, "first");
        runtime.log_message(1, "second");
        let (_, counts) = runtime.status();
        assert_eq!(counts[1], 2);

        let msg = runtime.get_log_message(1, 1).unwrap();
        assert_eq!(msg.message, "second");
        assert!(runtime.get_log_message(1, 5).is_none());
        assert!(runtime.get_log_message(9, 0).is_none());

        runtime.reset_log_count();
        assert_eq!(runtime.status().1, [0; LOG_LEVELS]);
    }

    #[cfg(unix)]
    #[test]
    fn test_remote_exec_captures_output() {
        let runtime = LocalRuntime::new();
        let (code, output) = runtime.remote_exec("echo hello");
        assert_eq!(code, 0);
        assert!(output.contains("hello"));
    }

    #[test]
    fn test_identity_is_stable() {
        let runtime = LocalRuntime::new();
        let a = runtime.identity().unwrap();
        let b = runtime.identity().unwrap();
        assert_eq!(a, b);
        assert!(!a.secret.is_empty());
    }
}
