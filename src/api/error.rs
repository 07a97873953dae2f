//! HTTP mapping for crate errors. Every error body is `{"detail": "..."}`.

use axum::Json;
use axum::extract::FromRequest;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::error::{Error, ProxyError, RunnerError, TaskError, TrustError};

impl Error {
    /// Status code this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Task(e) => match e {
                TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
                TaskError::Validation(_) => StatusCode::BAD_REQUEST,
                TaskError::Conflict(_) | TaskError::InvalidTransition { .. } => StatusCode::CONFLICT,
                TaskError::Forbidden(_) => StatusCode::FORBIDDEN,
            },
            Error::Trust(e) => trust_status(e),
            Error::Proxy(e) => match e {
                ProxyError::UnknownNode { .. } => StatusCode::NOT_FOUND,
                ProxyError::NodeRequired
                | ProxyError::EnrollmentNotConfigured
                | ProxyError::InvalidTaskId(_) => {
                    StatusCode::BAD_REQUEST
                }
                ProxyError::Unreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ProxyError::Unauthorized { .. } | ProxyError::InvalidResponse { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                ProxyError::Upstream { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                ProxyError::Trust(_) | ProxyError::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Runner(RunnerError::Unavailable(_)) | Error::NotReady(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Config(_) | Error::Store(_) | Error::Relay(_) | Error::Runner(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show a caller.
    fn detail(&self) -> String {
        match self {
            Error::Proxy(ProxyError::Upstream { detail, .. }) => detail.clone(),
            Error::Config(_)
            | Error::Store(_)
            | Error::Relay(_)
            | Error::Trust(TrustError::KeyMaterial { .. } | TrustError::Signing(_)) => {
                "Internal server error".to_string()
            }
            Error::Runner(e) if !matches!(e, RunnerError::Unavailable(_)) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

fn trust_status(e: &TrustError) -> StatusCode {
    match e {
        TrustError::Missing | TrustError::Rejected { .. } | TrustError::NoTrustedKeys => {
            StatusCode::UNAUTHORIZED
        }
        TrustError::EnrollmentDisabled | TrustError::EnrollmentDenied => StatusCode::FORBIDDEN,
        TrustError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        TrustError::KeyMaterial { .. } | TrustError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "Request rejected");
        }
        let body = Json(serde_json::json!({ "detail": self.detail() }));
        (status, body).into_response()
    }
}

/// Malformed bodies are validation errors with the usual `detail` body.
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        TaskError::Validation(rejection.body_text()).into()
    }
}

/// `Json` extractor whose rejection is a crate [`Error`].
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct ApiJson<T>(pub T);
