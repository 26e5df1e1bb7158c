//! Core module containing the main functionality of PLCLink
//!
//! This module provides:
//! - Single-flight job worker serializing controller state access
//! - RPC session layer (server, client connector, wire protocol)
//! - Debug trace buffer codec with the IEC type table
//! - mDNS service advertisement and discovery
//! - Pre-shared-key credential store with import/export merge
//! - Controller operation surface and the in-process runtime

pub mod codec;
pub mod control;
pub mod discovery;
pub mod psk;
pub mod rpc;
pub mod worker;
