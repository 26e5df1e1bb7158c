//! # PLCLink Core Library
//!
//! Runtime control and debug-protocol layer connecting a development
//! front-end to a running automation controller:
//! - Single-flight job worker serializing access to controller state
//! - RPC session with restart/stop lifecycle and idle reaping
//! - Debug trace buffer decoding into typed values
//! - mDNS service advertisement and discovery
//! - Pre-shared-key credential store with import/export merge
//!
//! ## Example
//!
//! ```rust,no_run
//! use plclink_core::core::rpc::client::{self, Connector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let proxy = client::connect("tcp://10.0.0.5:61131", None).await?;
//!
//!     if proxy.start_plc().await {
//!         let (status, _log_counts) = proxy.get_plc_status().await;
//!         println!("controller is {status}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::ServiceConfig;
pub use crate::core::codec::{decode_debug_buffer, encode_value, CodecError, DebugValue};
pub use crate::core::control::{
    ControlError, ControlTarget, LocalRuntime, PlcStatus, PskIdentity, TraceOrder, TraceSample,
};
pub use crate::core::discovery::{DiscoveredService, ServiceAdvertiser, ServiceRecord};
pub use crate::core::psk::{ImportOutcome, MergeDecision, PskRecord, PskStore};
pub use crate::core::rpc::client::{Connector, PlcProxy};
pub use crate::core::rpc::server::{RpcServer, ServerConfig, ServerHandle};
pub use crate::core::rpc::RpcError;
pub use crate::core::worker::{Worker, WorkerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
