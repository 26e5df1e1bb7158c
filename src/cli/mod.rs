//! CLI Module
//!
//! Exit codes and result plumbing shared by the daemon and the
//! front-end command-line tool.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};
