//! Error types for the AMI client

use thiserror::Error;

/// Result alias used throughout the manager-interface client.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors raised by the transport, the correlator and the command layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// The socket failed or was closed while the action was outstanding,
    /// or the client is reconnecting.
    #[error("connection lost")]
    ConnectionLost,

    /// No response arrived within the deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The PBX answered with a non-success response.
    #[error("command rejected: {message}")]
    CommandRejected { message: String },

    /// Login was refused.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// The client has been shut down.
    #[error("not connected")]
    NotConnected,

    /// Wire framing was violated.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line could not be parsed.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// A required parameter was missing or malformed.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A subscriber queue overflowed and events were dropped.
    #[error("event queue full")]
    QueueFull,

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmiError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        AmiError::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AmiError::InvalidArgument {
            message: message.into(),
        }
    }

    /// `true` for transport-level failures that a new connection may fix.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::ConnectionLost | AmiError::NotConnected | AmiError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            AmiError::Timeout { timeout_ms: 250 }.to_string(),
            "timed out after 250ms"
        );
        assert_eq!(
            AmiError::CommandRejected {
                message: "No such channel".into()
            }
            .to_string(),
            "command rejected: No such channel"
        );
    }

    #[test]
    fn connection_error_classification() {
        assert!(AmiError::ConnectionLost.is_connection_error());
        assert!(!AmiError::Timeout { timeout_ms: 1 }.is_connection_error());
        assert!(!AmiError::protocol_error("x").is_connection_error());
    }
}
