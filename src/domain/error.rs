use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the BLE transport layer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        Self(e.to_string())
    }
}

/// A payload the decoder does not recognise. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown frame format on {characteristic} ({len} bytes)")]
    UnknownFormat { characteristic: Uuid, len: usize },
}

/// Errors that end a session and reach the orchestrator.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device discovery failed: no device matching {target} within {timeout_secs}s")]
    DeviceNotFound { target: String, timeout_secs: u64 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service discovery failed: {0}")]
    ServiceNotFound(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("cancelled by user")]
    Cancelled,
}

impl BridgeError {
    /// Process exit code for a terminal error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DeviceNotFound { .. } => 2,
            Self::Connection(_) => 3,
            Self::ServiceNotFound(_) => 4,
            Self::Subscription(_) => 5,
            Self::Transport(_) => 6,
            Self::Cancelled => 0,
        }
    }

    /// Failures before the session reached streaming
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. }
                | Self::Connection(_)
                | Self::ServiceNotFound(_)
                | Self::Subscription(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_stage() {
        let err = BridgeError::DeviceNotFound {
            target: "B0:B3:53:EB:40:8D".to_string(),
            timeout_secs: 10,
        };
        assert!(err.to_string().starts_with("device discovery failed"));
        assert!(BridgeError::Subscription("rejected".into())
            .to_string()
            .starts_with("subscription failed"));
        assert!(BridgeError::ServiceNotFound("none".into())
            .to_string()
            .starts_with("service discovery failed"));
    }

    #[test]
    fn test_exit_codes_are_non_zero_for_failures() {
        assert_ne!(BridgeError::Connection("x".into()).exit_code(), 0);
        assert_ne!(BridgeError::Transport(TransportError::new("x")).exit_code(), 0);
        assert_eq!(BridgeError::Cancelled.exit_code(), 0);
    }

    #[test]
    fn test_setup_failures() {
        assert!(BridgeError::Connection("x".into()).is_setup_failure());
        assert!(!BridgeError::Transport(TransportError::new("x")).is_setup_failure());
        assert!(!BridgeError::Cancelled.is_setup_failure());
    }
}
