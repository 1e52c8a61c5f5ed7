//! Shared error types for the rosgraph middleware.

use thiserror::Error;

/// Top-level error type for every public rosgraph operation.
#[derive(Error, Debug)]
pub enum RosError {
    /// A connection header could not be decoded.
    #[error("Malformed connection header: {0}")]
    MalformedHeader(String),

    /// A message payload was truncated or otherwise invalid.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The peer declared a different message type or fingerprint.
    #[error("Handshake mismatch on field '{field}': local={local}, remote={remote}")]
    HandshakeMismatch {
        /// Header field that disagreed (`type`, `md5sum`, or `error`).
        field: String,
        /// The locally expected value.
        local: String,
        /// The value the peer sent.
        remote: String,
    },

    /// A registry (or node endpoint) call failed or returned a fault.
    #[error("Registry fault ({code}): {message}")]
    RegistryFault {
        /// Status code of the fault (0 = failure, -1 = error).
        code: i32,
        /// Human-readable status message.
        message: String,
    },

    /// A server could not bind or was started twice.
    #[error("Address in use: {0}")]
    AddressInUse(String),

    /// A server was used before start or after shutdown.
    #[error("Not running: {0}")]
    NotRunning(String),

    /// A graph name failed validation.
    #[error("Invalid graph name: {0:?}")]
    InvalidGraphName(String),

    /// No descriptor registered for the requested message/service type.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A message definition could not be parsed.
    #[error("Invalid message definition for {type_name}: {reason}")]
    InvalidDefinition {
        /// Type being defined.
        type_name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A field access did not match the message layout.
    #[error("Field error: {0}")]
    Field(String),

    /// The remote service handler reported a failure.
    #[error("Service call failed: {0}")]
    ServiceFailed(String),

    /// An I/O step exceeded its deadline.
    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// Configured deadline.
        timeout_ms: u64,
    },

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame exceeded the maximum accepted size.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: u32,
        /// Maximum accepted size.
        max: u32,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON encoding error occurred on the RPC channel.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RosError {
    /// Shorthand for a type/fingerprint disagreement.
    pub fn mismatch(field: &str, local: impl Into<String>, remote: impl Into<String>) -> Self {
        RosError::HandshakeMismatch {
            field: field.to_string(),
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Shorthand for a truncated payload.
    pub fn truncated(needed: usize, available: usize) -> Self {
        RosError::Serialization(format!(
            "truncated input: needed {needed} bytes, {available} available"
        ))
    }
}

/// Alias for Result with RosError.
pub type RosResult<T> = Result<T, RosError>;
