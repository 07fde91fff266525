//! Hook-layer errors, rendered as Kubernetes Status responses so kubectl
//! and client-go callers see conventional failures.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the hook handlers
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the host cluster
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Upstream (virtual API server) unreachable or misbehaving
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The requested object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The request cannot be translated
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                StatusCode::from_u16(ae.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::Kube(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::BadRequest(_) => "BadRequest",
            Error::Upstream(_) => "ServiceUnavailable",
            _ => "InternalError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            Error::NotFound("node x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn host_api_status_codes_pass_through() {
        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        }));
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }
}
