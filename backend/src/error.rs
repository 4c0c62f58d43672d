//! Error types for the balancer and autoscaler.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use autobatch_common::{ErrorBody, ErrorKind};

/// Errors surfaced by dispatch, cold start, scaling and the admin surface.
///
/// `Clone` so that a single backend failure can be handed to every request of
/// the batch it hit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Worker server disconnected: {0}")]
    BackendDisconnected(String),

    #[error("Worker server error: {0}")]
    BackendError(String),

    #[error("Result has {actual} items but batch is {expected}")]
    ResultCountMismatch { expected: usize, actual: usize },

    #[error("None of the workers are healthy")]
    NoHealthyWorkers,

    #[error("Cold start proxy failed: {0}")]
    ColdStartFailure(String),

    #[error("Scaling metrics unavailable: {0}")]
    ScalingMetricsUnavailable(String),

    #[error("Worker lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Incorrect credentials")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::BackendDisconnected(_) => ErrorKind::BackendDisconnected,
            // A count mismatch is a protocol violation by the worker.
            Error::BackendError(_) | Error::ResultCountMismatch { .. } => ErrorKind::BackendError,
            Error::NoHealthyWorkers => ErrorKind::NoHealthyWorkers,
            Error::ColdStartFailure(_) => ErrorKind::ColdStartFailure,
            Error::InvalidRequest(_) => ErrorKind::Validation,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::ScalingMetricsUnavailable(_) | Error::Lifecycle(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::BackendDisconnected | ErrorKind::BackendError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorKind::NoHealthyWorkers => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ColdStartFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a transport-level failure talking to a worker.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Error::BackendDisconnected(err.to_string())
        } else if err.is_decode() {
            Error::BackendError(format!("invalid response body: {}", err))
        } else {
            Error::BackendError(err.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorBody::new(self.kind(), self.to_string()));

        if matches!(self, Error::Unauthorized) {
            return (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response();
        }
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
