//! Error types for sqlfleet.
//!
//! Errors fall into two groups. Resolution-phase errors happen before any
//! target is touched and abort the whole invocation. Target-scoped errors
//! (connection and execution failures) only affect the target they occurred on.

use thiserror::Error;

/// Main error type for sqlfleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Mutually exclusive inputs were both supplied, or a required one was missing.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A file, directory or role does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An input of a shape the resolver cannot handle.
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// A path resolved to something that is not on the local filesystem.
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Both download attempts for a script URL failed.
    #[error("Download error: {0}")]
    Download(String),

    /// Serializing an object into SQL text failed.
    #[error("Script generation error: {0}")]
    Generation(String),

    /// Connecting to (or binding) a single target failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A query or membership change failed on a single target.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Configuration errors (invalid config file, bad instance definition, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Creates an invalid argument error with the given message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates a not found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an unsupported input error with the given message.
    pub fn unsupported_input(msg: impl Into<String>) -> Self {
        Self::UnsupportedInput(msg.into())
    }

    /// Creates an invalid reference error with the given message.
    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    /// Creates a download error with the given message.
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Creates a script generation error with the given message.
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates an execution error with the given message.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "Invalid Argument",
            Self::NotFound(_) => "Not Found",
            Self::UnsupportedInput(_) => "Unsupported Input",
            Self::InvalidReference(_) => "Invalid Reference",
            Self::Download(_) => "Download Error",
            Self::Generation(_) => "Script Generation Error",
            Self::Connection(_) => "Connection Error",
            Self::Execution(_) => "Execution Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true if this error only concerns the target it was raised for.
    ///
    /// Target-scoped errors are reported and the batch moves on to the next
    /// target; every other error aborts the invocation.
    pub fn is_target_scoped(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Execution(_))
    }

    /// Returns true if this error aborts the whole invocation.
    pub fn is_batch_fatal(&self) -> bool {
        !self.is_target_scoped()
    }
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

/// Result type alias using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;
