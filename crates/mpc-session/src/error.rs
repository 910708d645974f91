//! Error types for MPC session operations

use thiserror::Error;

/// Result type alias for MPC session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating an MPC operation
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid service configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Registering with the relay failed
    #[error("Session registration failed: {0}")]
    Registration(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Transport encryption error
    #[error("Codec error: {0}")]
    Codec(String),

    /// The crypto engine rejected a call
    #[error("Engine error: {0}")]
    Engine(String),

    /// A bounded wait expired
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The inbound side of the message pump did not finish in time
    #[error("TSS protocol timed out in session {session_id}")]
    ProtocolTimeout { session_id: String },

    /// The setup message does not commit to the message being signed
    #[error("Setup message hash {actual} does not match message {expected}")]
    SetupMismatch { expected: String, actual: String },

    /// Keyshare persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Every attempt of an operation failed
    #[error("{operation} failed after {attempts} attempts: {source}")]
    AttemptsExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed attempt may be retried.
    ///
    /// Input problems, registration failures and setup integrity violations
    /// abort the operation immediately.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidInput(_)
                | Error::InvalidConfig(_)
                | Error::Registration(_)
                | Error::SetupMismatch { .. }
                | Error::AttemptsExhausted { .. }
        )
    }

    /// Whether this is the pump timeout, possibly behind exhausted attempts
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ProtocolTimeout { .. } => true,
            Error::AttemptsExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Deserialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Deserialization(e.to_string())
    }
}
