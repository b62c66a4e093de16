//! Riskfuse Runtime
//!
//! Pipeline orchestration on top of `riskfuse-core` and `riskfuse-io`:
//! - TOML configuration with documented defaults
//! - Step state machine with cancellation and structured error log
//! - Run report and Markdown summary

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod summary;

pub use config::*;
pub use orchestrator::*;
pub use report::*;
pub use summary::*;
