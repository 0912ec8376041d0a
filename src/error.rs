//! Error types for the bridge.
//!
//! Only [`BridgeError::HostNotFound`], [`BridgeError::Spawn`] and
//! [`BridgeError::Bind`] are fatal to a bridge instance. Parse and transport
//! errors are scoped to one message or one viewer and are logged, not
//! propagated.

use thiserror::Error;

/// Bridge error type covering every failure mode of a session.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The PTY host executable could not be located.
    #[error("PTY host executable not found: {0}")]
    HostNotFound(String),

    /// The PTY host subprocess could not be started.
    #[error("failed to start PTY host {program}: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The viewer endpoint could not listen on its address.
    #[error("failed to bind viewer endpoint {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A message from the PTY host or from a viewer could not be parsed.
    #[error("malformed message: {0}")]
    Parse(String),

    /// Writing to a viewer connection failed.
    #[error("transport write failed: {0}")]
    TransportWrite(String),

    /// The viewer connection is already closed.
    #[error("transport closed")]
    TransportClosed,
}

impl BridgeError {
    /// Returns true for errors raised while starting the PTY host.
    pub fn is_spawn(&self) -> bool {
        matches!(self, BridgeError::HostNotFound(_) | BridgeError::Spawn { .. })
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Parse(err.to_string())
    }
}

impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Parse(format!("invalid base64 payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_not_found_display() {
        let err = BridgeError::HostNotFound("webify-pty-host".to_string());
        assert_eq!(
            err.to_string(),
            "PTY host executable not found: webify-pty-host"
        );
        assert!(err.is_spawn());
    }

    #[test]
    fn test_spawn_display() {
        let err = BridgeError::Spawn {
            program: "/nope".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            err.to_string(),
            "failed to start PTY host /nope: no such file"
        );
        assert!(err.is_spawn());
    }

    #[test]
    fn test_recoverable_errors_are_not_spawn() {
        assert!(!BridgeError::Parse("x".to_string()).is_spawn());
        assert!(!BridgeError::TransportWrite("reset".to_string()).is_spawn());
        assert!(!BridgeError::TransportClosed.is_spawn());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: BridgeError = json_err.into();
        assert!(matches!(err, BridgeError::Parse(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }
}
