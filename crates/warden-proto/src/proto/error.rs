use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,

    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Default::default(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::GateBusy)
    }
}

/// One code per error kind so front-ends can render the specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    UnsupportedProtocol,

    GateBusy,
    InvalidConfiguration,

    AlreadyRunning,
    LaunchFailure,
    StartupTimeout,
    ShutdownTimeout,
    NotRunning,

    SourceUnavailable,
    ConcurrentBackupInProgress,
    ServerMustBeStopped,
    SafetyArchiveFailed,
    RecordNotFound,

    ServerNotRunning,
    PlayerNotOnline,
    InvalidPlayerIdentifier,

    LoadoutNotFound,
    LoadoutInUse,
    InvalidLoadout,

    IoFailure,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gate_busy_is_retryable() {
        assert!(RpcError::new(ErrorCode::GateBusy, "busy").is_retryable());
        assert!(!RpcError::new(ErrorCode::SafetyArchiveFailed, "nope").is_retryable());
    }

    #[test]
    fn details_survive_the_wire() {
        let err = RpcError::new(ErrorCode::SafetyArchiveFailed, "no data was altered")
            .with_detail("data_altered", "false");
        let json = serde_json::to_string(&err).expect("serialize");
        let back: RpcError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.code, ErrorCode::SafetyArchiveFailed);
        assert_eq!(back.details.get("data_altered").map(String::as_str), Some("false"));
    }
}
