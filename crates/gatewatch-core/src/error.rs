//! Application error types with rich context

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Gateway transport error: {message}")]
    Transport { message: String },

    #[error("WebSocket handshake failed: {message}")]
    Handshake { message: String },

    #[error("Gateway protocol error: {message}")]
    Protocol { message: String },

    // ─────────────────────────────────────────────────────────────
    // RPC Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Gateway not connected")]
    NotConnected,

    #[error("Gateway request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Gateway connection closed while request was in flight")]
    ConnectionClosed,

    #[error("Gateway error {code}: {message}")]
    Rpc { code: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Identity Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device identity error: {message}")]
    Identity { message: String },

    // ─────────────────────────────────────────────────────────────
    // Health Escalation Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Gateway restart failed: {message}")]
    Restart { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(method: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            method: method.into(),
            timeout,
        }
    }

    /// Create an [`Error::Rpc`] from a server-supplied code and message.
    pub fn rpc(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    pub fn restart(message: impl Into<String>) -> Self {
        Self::Restart {
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Transport and connection-level failures are retried by the
    /// reconnect loop; the caller may simply try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::Handshake { .. }
                | Error::Protocol { .. }
                | Error::NotConnected
                | Error::Timeout { .. }
                | Error::ConnectionClosed
                | Error::Identity { .. }
                | Error::Restart { .. }
        )
    }

    /// Check if this error should trigger application exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigInvalid { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::transport("connection refused");
        assert_eq!(
            err.to_string(),
            "Gateway transport error: connection refused"
        );

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "Gateway not connected");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_rpc_error_carries_code_and_message() {
        let err = Error::rpc("404", "session not found");
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("session not found"));
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, "404");
                assert_eq!(message, "session not found");
            }
            other => panic!("expected Rpc, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_error_names_method() {
        let err = Error::timeout("sessions.list", Duration::from_millis(250));
        assert!(err.to_string().contains("sessions.list"));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::config_invalid("bad port").is_fatal());
        assert!(!Error::NotConnected.is_fatal());
        assert!(!Error::identity("corrupt key").is_fatal());
    }

    #[test]
    fn test_error_is_recoverable() {
        assert!(Error::NotConnected.is_recoverable());
        assert!(Error::ConnectionClosed.is_recoverable());
        assert!(Error::handshake("bad accept").is_recoverable());
        assert!(Error::restart("exit status 1").is_recoverable());
        assert!(!Error::rpc("1", "denied").is_recoverable());
        assert!(!Error::config_invalid("bad").is_recoverable());
    }
}
