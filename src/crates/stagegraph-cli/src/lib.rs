//! # stagegraph-cli
//!
//! Library half of the `stagegraph` binary: layered configuration, logging
//! setup and the commands that drive order workflows from the terminal.

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

pub use commands::{render_status, render_summary, App, OrderSnapshot};
pub use config::{AppConfig, CheckpointBackend, ConfigLoader, LogFormat, LoggingConfig};
pub use error::{CliError, Result};
