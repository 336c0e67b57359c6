//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the warden.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation conflicts with the component's current state
    /// (build already running, install in progress). Retry later.
    #[error("busy: {0}")]
    Busy(String),

    /// A required resource is missing or refused (no install, no project
    /// file, lease denied).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Bad input (malformed version string, oversized frame).
    #[error("validation error: {0}")]
    Validation(String),

    /// Topic/bridge protocol failures, including API incompatibility.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cancellation. Never logged as a failure.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout (engine readiness, socket I/O).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal errors (recovered panics, broken invariants on disk).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Download errors (boxed to reduce Result size).
    #[error("http error: {0}")]
    Http(#[from] Box<reqwest::Error>),

    /// Runtime archive errors.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable upper-case code for logs and CLI exit reporting.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Busy(_) => "BUSY",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Protocol(_) => "PROTOCOL",
            Error::Cancelled(_) => "CANCELLED",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "INTERNAL",
            Error::Http(_) => "UNAVAILABLE",
            Error::Archive(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

// Convenience constructors
impl Error {
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(Box::new(err))
    }
}
