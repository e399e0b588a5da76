//! Shared types: configuration and errors.

pub mod config;
pub mod errors;

pub use config::{DirsConfig, FrameworkConfig, ObservabilityConfig, StartupConfig, PORT_FILE_NAME};
pub use errors::{Error, Result};
