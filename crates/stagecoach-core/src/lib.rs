//! Shared types, configuration, and persisted run state for Stagecoach.

pub mod chain;
pub mod command;
pub mod config;
pub mod manifest;
pub mod model;
pub mod state;
pub mod util;

pub use chain::*;
pub use command::*;
pub use config::*;
pub use manifest::*;
pub use model::*;
pub use state::*;
pub use util::program_in_path;
