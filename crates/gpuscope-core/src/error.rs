//! Error handling for gpuscope
//!
//! Provides a unified error type and result type for use across all gpuscope
//! components.

/// Result type alias for gpuscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for gpuscope
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Transient device-library read or control errors
    #[error("Device library error: {0}")]
    DeviceLibrary(String),

    /// The device-library connection is gone; fatal to the current registry
    #[error("Device library connection not valid: {0}")]
    ConnectionNotValid(String),

    /// A setting was not configured; benign during cleanup
    #[error("Setting not configured: {0}")]
    NotConfigured(String),

    /// A field is not being watched; benign during cleanup
    #[error("Field is not being watched: {0}")]
    FieldNotWatched(String),

    /// The driver-level management library is absent on this host
    #[error("NVML doesn't exist: {0}")]
    NvmlMissing(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Gather was attempted on a registry that is tearing down
    #[error("registry is shutting down")]
    RegistryShuttingDown,

    /// Kubernetes client / pod-resources errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    /// Network or gRPC transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a device library error
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceLibrary(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a Kubernetes error
    pub fn kubernetes(msg: impl Into<String>) -> Self {
        Self::Kubernetes(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that are expected while tearing down device-library resources
    /// and must be swallowed by cleanup paths.
    pub fn is_benign_cleanup(&self) -> bool {
        matches!(self, Error::NotConfigured(_) | Error::FieldNotWatched(_))
    }

    /// Errors that invalidate the whole registry and force a process exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectionNotValid(_))
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::DeviceLibrary(_) => "device_library",
            Error::ConnectionNotValid(_) => "connection_not_valid",
            Error::NotConfigured(_) => "not_configured",
            Error::FieldNotWatched(_) => "field_not_watched",
            Error::NvmlMissing(_) => "nvml_missing",
            Error::NotFound(_) => "not_found",
            Error::RegistryShuttingDown => "registry_shutting_down",
            Error::Kubernetes(_) => "kubernetes",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Other(_) => "other",
        }
    }
}
