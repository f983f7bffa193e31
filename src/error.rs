/// Unified error handling for the portero proxy
///
/// Groups errors by origin: client/backend protocol violations, backend
/// I/O, configuration, pooling, topology discovery and redirection. The
/// policy is that a request never loses its reply: anything that goes wrong
/// on the way to a backend is converted into a RESP error at the request's
/// position in the client's pipeline.
use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Main error type for portero operations
#[derive(Debug, Error)]
pub enum PorteroError {
    /// Network-related errors
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// Malformed RESP from a client or a backend
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Backend conversation errors (dial, handshake, pipeline)
    #[error("backend error: {message}")]
    Backend { message: String },

    /// Connection pool errors
    #[error("pool error: {message}")]
    Pool { message: String },

    /// Cluster topology discovery errors
    #[error("topology error: {message}")]
    Topology { message: String },

    /// MOVED/ASK re-execution errors
    #[error("redirect error: {message}")]
    Redirect { message: String },

    /// Address parsing errors
    #[error("address parsing error: {0}")]
    AddrParse(#[from] AddrParseError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for portero operations
pub type PorteroResult<T> = Result<T, PorteroError>;

impl PorteroError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        PorteroError::Protocol(message.into())
    }

    pub fn backend<S: Into<String>>(message: S) -> Self {
        PorteroError::Backend {
            message: message.into(),
        }
    }

    pub fn pool<S: Into<String>>(message: S) -> Self {
        PorteroError::Pool {
            message: message.into(),
        }
    }

    pub fn topology<S: Into<String>>(message: S) -> Self {
        PorteroError::Topology {
            message: message.into(),
        }
    }

    pub fn redirect<S: Into<String>>(message: S) -> Self {
        PorteroError::Redirect {
            message: message.into(),
        }
    }

    /// True when the error is a clean end-of-stream
    ///
    /// A peer hanging up mid-pipeline is routine churn, not noise worth an
    /// error-level log line.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            PorteroError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof
        )
    }

    /// The message to surface to the client as a RESP error payload
    pub fn resp_message(&self) -> String {
        match self {
            PorteroError::Backend { message }
            | PorteroError::Pool { message }
            | PorteroError::Redirect { message } => format!("ERR {}", message),
            other => format!("ERR {}", other),
        }
    }
}
