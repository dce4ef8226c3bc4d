//! Transport Error Types
//!
//! Error handling for socket adapters, the reactor and peer session
//! failures.

use emsg_codec::CodecError;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network connectivity errors (bind, listen, resolve)
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote:?})")]
    Connection {
        message: String,
        remote: Option<String>,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Framing errors on an established stream
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Message registry or codec failures
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Thread or runtime setup failures
    #[error("Initialization error: {message}")]
    Initialization {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote: Option<&str>) -> Self {
        Self::Connection {
            message: message.into(),
            remote: remote.map(|r| r.to_string()),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote: Option<&str>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote: remote.map(|r| r.to_string()),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an initialization error with source
    pub fn initialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Initialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Check if the reactor should retry the operation after backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Connection { .. } => true,
            TransportError::Timeout { .. } => true,
            TransportError::Io { .. } => true,
            TransportError::Protocol { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Codec(_) => false,
            TransportError::Initialization { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Codec(_) => "codec",
            TransportError::Initialization { .. } => "initialization",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TransportError::network("test message");
        assert_eq!(err.category(), "network");
        assert!(err.is_retryable());

        let err = TransportError::configuration("bad port", Some("port"));
        assert_eq!(err.category(), "configuration");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: TransportError = CodecError::UnknownType { type_id: 5 }.into();
        assert_eq!(err.category(), "codec");
        assert!(err.to_string().contains("0x00000005"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TransportError = io_err.into();
        assert_eq!(err.category(), "io");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_connection_error_display() {
        let err = TransportError::connection("write failed", Some("/tmp/x.sock"));
        let msg = err.to_string();
        assert!(msg.contains("write failed"));
        assert!(msg.contains("/tmp/x.sock"));
    }
}
