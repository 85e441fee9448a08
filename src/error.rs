//! Error types for the cache access layer.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cache access layer.
///
/// Registration never surfaces these to the caller (it reports `false`), but
/// builders, the provider lifecycle and client operations all return `Result<T>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or incomplete configuration.
    ///
    /// Raised when:
    /// - A server sub-builder is confirmed without an address
    /// - A configuration has no server endpoints
    /// - A master/slave topology cannot locate its master endpoint
    ///
    /// **Recovery:** Fix configuration. Never retried.
    Configuration(String),

    /// Provider name is not present in the provider registry.
    ProviderNotFound(String),

    /// Connection or pool setup failed while initializing a topology.
    ///
    /// Common causes:
    /// - Server unreachable
    /// - Authentication rejected
    /// - Sentinel could not resolve the monitored master
    ///
    /// The partially built provider has already been destroyed when this is returned.
    ConnectionInit(String),

    /// Password protection failed (encrypt, decrypt or scheme switch).
    ///
    /// Kept apart from `ConnectionInit` so callers can tell a bad credential
    /// setup from a bad network.
    Credential(String),

    /// Backend storage error during a runtime operation.
    ///
    /// **Recovery:** Retry the operation.
    Backend(String),

    /// Operation exceeded the backend's timeout.
    ///
    /// **Recovery:** Retry with backoff.
    Timeout(String),

    /// Configuration could not be (de)serialized.
    Serialization(String),

    /// Configuration persistence failed.
    Io(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend(_) | Error::Timeout(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::ProviderNotFound(name) => write!(f, "Provider not found: {}", name),
            Error::ConnectionInit(msg) => write!(f, "Connection initialization error: {}", msg),
            Error::Credential(msg) => write!(f, "Credential error: {}", msg),
            Error::Backend(msg) => write!(f, "Backend error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::Io(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            Error::Timeout(format!("Redis error: {}", e))
        } else {
            Error::Backend(format!("Redis error: {}", e))
        }
    }
}
