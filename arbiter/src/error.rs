//! Error kinds surfaced across the driver/pool and session boundaries.

use serde::Serialize;
use thiserror::Error;

/// Close code sent to a client that never authenticated in time.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// Close code sent to a client running an outdated protocol version.
pub const CLOSE_VERSION_OUTDATED: u16 = 4002;
/// Close code sent to a client presenting an invalid token.
pub const CLOSE_AUTH_FAILED: u16 = 4003;

/// Process-level failures of a single engine driver. Parse anomalies inside
/// `info` lines never reach this type - they are absorbed by the codec.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The subprocess exited, closed a pipe, or broke the protocol framing.
    #[error("engine crashed: {0}")]
    Crash(String),
    /// The search exceeded its wall deadline.
    #[error("engine search timed out")]
    Timeout,
    /// The job was superseded by its owner. Never shown to clients.
    #[error("analysis canceled")]
    Canceled,
    /// The pool is shutting down and will not run the job.
    #[error("engine pool closed")]
    PoolClosed,
}

impl EngineError {
    /// Whether the owning driver must be torn down. A plain cancellation
    /// drains the search and leaves the process reusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Canceled)
    }
}

/// Client-visible error codes, serialized verbatim into error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    UnknownMessageType,
    Unauthenticated,
    AuthFailed,
    VersionOutdated,
    InvalidRequest,
    EngineTimeout,
    EngineCrash,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::UnknownMessageType => "unknown_message_type",
            Self::Unauthenticated => "unauthenticated",
            Self::AuthFailed => "auth_failed",
            Self::VersionOutdated => "version_outdated",
            Self::InvalidRequest => "invalid_request",
            Self::EngineTimeout => "engine_timeout",
            Self::EngineCrash => "engine_crash",
            Self::Internal => "internal",
        }
    }
}

/// A rejected client request: the code that goes on the wire plus a
/// human-readable detail line.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClientError {
    pub code: ErrorCode,
    pub message: String,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl From<&EngineError> for ErrorCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Crash(_) => Self::EngineCrash,
            EngineError::Timeout => Self::EngineTimeout,
            // Canceled results are swallowed by the session before mapping;
            // anything that still leaks maps to an internal fault.
            EngineError::Canceled | EngineError::PoolClosed => Self::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(EngineError::Crash("stdout closed".into()).is_fatal());
        assert!(EngineError::Timeout.is_fatal());
        assert!(!EngineError::Canceled.is_fatal());
    }

    #[test]
    fn wire_codes() {
        assert_eq!(ErrorCode::UnknownMessageType.as_str(), "unknown_message_type");
        assert_eq!(
            serde_json::to_string(&ErrorCode::EngineTimeout).unwrap(),
            "\"engine_timeout\""
        );
        assert_eq!(ErrorCode::from(&EngineError::Timeout), ErrorCode::EngineTimeout);
    }
}
