//! Configuration module wiring for Stagecoach.
//!
//! Keeps config types, I/O, runtime defaults, and validation in separate files.

mod config_io;
mod config_runtime;
mod config_types;
mod config_validate;

pub use config_io::ConfigError;
pub use config_types::*;
pub use config_validate::ValidationIssue;
