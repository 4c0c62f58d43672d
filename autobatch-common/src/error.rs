//! Structured error bodies returned to clients.

use serde::{Deserialize, Serialize};

/// Stable error kind surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The worker did not answer within the inference timeout.
    Timeout,
    /// The worker closed or refused the connection.
    BackendDisconnected,
    /// The worker answered with an error or a malformed result.
    BackendError,
    /// No worker is available and no cold-start proxy is configured.
    NoHealthyWorkers,
    /// The cold-start proxy failed to answer.
    ColdStartFailure,
    /// The request payload could not be parsed.
    Validation,
    /// Missing or wrong admin credential.
    Unauthorized,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BackendDisconnected => "backend_disconnected",
            Self::BackendError => "backend_error",
            Self::NoHealthyWorkers => "no_healthy_workers",
            Self::ColdStartFailure => "cold_start_failure",
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"error": {"type": ..., "message": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind,
                message: message.into(),
            },
        }
    }
}
