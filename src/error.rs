//! Unified error handling for the harbor driver
//!
//! This module provides the error type system covering every failure the
//! driver can surface: transport failures, malformed protocol input,
//! authentication errors, server-reported errors, host exhaustion and pool
//! exhaustion.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for driver operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transport-level errors (connect refused, reset, EOF)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Truncated input: a reader asked for more bytes than the packet holds
    #[error("Decode error: requested {requested} bytes but only {remaining} remaining")]
    Decode { requested: usize, remaining: usize },

    /// Malformed or unexpected protocol input
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Packet sequence number mismatch
    #[error("Protocol desynchronization: expected sequence {expected}, got {actual}")]
    Desync { expected: u8, actual: u8 },

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Error packet returned by the server
    #[error("Server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Every candidate host of every group failed
    #[error("No active connection for service '{service}': {reason}")]
    NoActiveConnection {
        service: String,
        reason: String,
        last_error: Option<Box<DriverError>>,
    },

    /// Pool could not hand out a connection in time
    #[error(
        "No connection available within the specified time (option 'connect_timeout': {} ms)",
        .timeout.as_millis()
    )]
    NoConnectionAvailable {
        timeout: Duration,
        last_error: Option<Box<DriverError>>,
    },

    /// Pool is closing or closed
    #[error("Pool is closed")]
    PoolClosed,

    /// Connection was aborted by pool shutdown or a previous fatal error
    #[error("Connection aborted")]
    ConnectionAborted,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Authentication-specific errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("clear text password requires an encrypted connection")]
    CleartextOverInsecureChannel,

    #[error("unsupported authentication plugin '{0}'")]
    UnsupportedPlugin(String),

    #[error("RSA public key is not available client side (option 'server_rsa_public_key_file' not set)")]
    MissingPublicKey,

    #[error("RSA public key retrieval is not allowed (option 'allow_public_key_retrieval' not set)")]
    PublicKeyRetrievalNotAllowed,

    #[error("invalid RSA public key: {0}")]
    InvalidPublicKey(String),

    #[error("password encryption failed: {0}")]
    Encryption(String),

    #[error("unexpected authentication response byte 0x{0:02x}")]
    UnexpectedResponse(u8),

    #[error("digest length {digest} does not match scramble length {mix}")]
    DigestLength { digest: usize, mix: usize },
}

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Convenience methods for creating specific error types
impl DriverError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        DriverError::Protocol(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        DriverError::Internal {
            message: message.into(),
        }
    }

    /// Create a host exhaustion error wrapping the last underlying failure
    pub fn no_active_connection<S: Into<String>>(
        service: S,
        last_error: Option<DriverError>,
    ) -> Self {
        let reason = match &last_error {
            Some(e) => e.to_string(),
            None => "all hosts are blacklisted".to_string(),
        };
        DriverError::NoActiveConnection {
            service: service.into(),
            reason,
            last_error: last_error.map(Box::new),
        }
    }

    /// Check if this error is recoverable by trying another host
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DriverError::Network(_) | DriverError::Timeout { .. } | DriverError::ConnectionAborted
        )
    }

    /// Check if the physical connection must be discarded after this error
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, DriverError::Server { .. } | DriverError::Config(_))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DriverError::Config(_) => ErrorSeverity::Critical,
            DriverError::Internal { .. } => ErrorSeverity::Critical,
            DriverError::Auth(_) => ErrorSeverity::Critical,
            DriverError::Network(_) => ErrorSeverity::Warning,
            DriverError::Timeout { .. } => ErrorSeverity::Warning,
            DriverError::Server { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
