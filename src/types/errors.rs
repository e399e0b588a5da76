//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the modulith kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// A declared dependency is absent from the resolution universe.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// A service name is already bound in the registry.
    #[error("duplicate service name: {0}")]
    DuplicateName(String),

    /// More than one service is registered under a capability type.
    #[error("ambiguous service: {0}")]
    AmbiguousService(String),

    /// An injection target could not be resolved from the registry.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// A required configuration key is absent.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Conflicting declarations (e.g. multiple lifecycle hooks).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A module's start routine exceeded its deadline.
    #[error("module startup timeout: {0}")]
    StartupTimeout(String),

    /// A module package does not follow the expected layout.
    #[error("invalid package format: {0}")]
    PackageFormat(String),

    /// The operation targets a module that is currently running.
    #[error("module running: {0}")]
    ModuleRunning(String),

    /// A module's start routine failed.
    #[error("module startup failed: {0}")]
    StartupFailed(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Archive read/extract errors.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn missing_dependency(msg: impl Into<String>) -> Self {
        Self::MissingDependency(msg.into())
    }

    pub fn dependency_cycle(msg: impl Into<String>) -> Self {
        Self::DependencyCycle(msg.into())
    }

    pub fn duplicate_name(msg: impl Into<String>) -> Self {
        Self::DuplicateName(msg.into())
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousService(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::InstanceNotFound(msg.into())
    }

    pub fn configuration_missing(msg: impl Into<String>) -> Self {
        Self::ConfigurationMissing(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn startup_timeout(msg: impl Into<String>) -> Self {
        Self::StartupTimeout(msg.into())
    }

    pub fn package_format(msg: impl Into<String>) -> Self {
        Self::PackageFormat(msg.into())
    }

    pub fn module_running(msg: impl Into<String>) -> Self {
        Self::ModuleRunning(msg.into())
    }

    pub fn startup_failed(msg: impl Into<String>) -> Self {
        Self::StartupFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
