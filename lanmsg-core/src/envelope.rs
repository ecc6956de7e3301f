//! Transfer envelope: the one message carried by a single TCP connection.

use serde::{Deserialize, Serialize};

/// Message code used for synthetic envelopes that report a receive-side failure.
pub const FAILURE_CODE: i32 = 0;

/// Error detail that can travel inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("connect to remote failed: {0}")]
    ConnectToRemote(String),
    #[error("create socket failed: {0}")]
    CreateSocket(String),
    #[error("read from client socket failed: {0}")]
    ReadFromClientSocket(String),
    #[error("unknown remote error")]
    Unknown,
}

/// Envelope exchanged between devices: code, optional payload, optional error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    pub code: i32,
    pub payload: Option<String>,
    pub error: Option<RemoteError>,
}

impl TransferEnvelope {
    pub fn new(code: i32, payload: Option<String>) -> Self {
        Self {
            code,
            payload,
            error: None,
        }
    }

    /// Synthetic envelope emitted by the host when reading a connection failed.
    pub fn read_failure(reason: impl Into<String>) -> Self {
        Self {
            code: FAILURE_CODE,
            payload: None,
            error: Some(RemoteError::ReadFromClientSocket(reason.into())),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Copy of this envelope with the payload prefixed by the sender name.
    pub fn stamped(&self, sender: &str) -> Self {
        let body = self.payload.as_deref().unwrap_or_default();
        Self {
            code: self.code,
            payload: Some(format!("From :{sender} -> {body}")),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_failure_carries_reason() {
        let env = TransferEnvelope::read_failure("connection reset");
        assert!(env.is_failure());
        assert_eq!(env.code, FAILURE_CODE);
        assert_eq!(env.payload, None);
        assert_eq!(
            env.error,
            Some(RemoteError::ReadFromClientSocket("connection reset".into()))
        );
    }

    #[test]
    fn stamped_prefixes_payload() {
        let env = TransferEnvelope::new(200, Some("hi".into()));
        let stamped = env.stamped("kitchen");
        assert_eq!(stamped.code, 200);
        assert_eq!(stamped.payload.as_deref(), Some("From :kitchen -> hi"));
        assert!(!stamped.is_failure());
    }

    #[test]
    fn stamped_without_payload() {
        let env = TransferEnvelope::new(7, None);
        assert_eq!(env.stamped("a").payload.as_deref(), Some("From :a -> "));
    }
}
