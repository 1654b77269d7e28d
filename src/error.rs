//! Proxy error taxonomy and its mapping to HTTP responses.
//!
//! Components below the frontend only ever return [`ProxyError`]; the
//! [`IntoResponse`] impl here is the one place where an error kind becomes a
//! status code.

use aviso_credentials::CredentialError;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::range::RangeError;

pub const HEADER_X_AVISO_ERROR_CODE: &str = "X-Aviso-Error-Code";

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Client-caused: malformed header or body, empty key, malformed range,
    /// compacted history.
    #[error("{0}")]
    InvalidInput(String),

    /// The identity may not read the requested range.
    #[error("{0}")]
    Denied(String),

    /// Backend or permission store unreachable, timed out or failing.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        ProxyError::InvalidInput(message.into())
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        ProxyError::Denied(reason.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ProxyError::Denied(_) => StatusCode::FORBIDDEN,
            ProxyError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code, sent in [`HEADER_X_AVISO_ERROR_CODE`].
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::InvalidInput(_) => "invalid_input",
            ProxyError::Denied(_) => "authorization_denied",
            ProxyError::Internal(_) => "service_unavailable",
        }
    }

    /// Outcome label used in logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            ProxyError::InvalidInput(_) => "invalid",
            ProxyError::Denied(_) => "deny",
            ProxyError::Internal(_) => "unavailable",
        }
    }
}

impl From<CredentialError> for ProxyError {
    fn from(err: CredentialError) -> Self {
        ProxyError::InvalidInput(err.to_string())
    }
}

impl From<RangeError> for ProxyError {
    fn from(err: RangeError) -> Self {
        ProxyError::InvalidInput(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        create_error(self.status(), self.code(), &self.to_string())
    }
}

pub fn create_error(status: StatusCode, code: &str, message: &str) -> Response {
    let mut headers = HeaderMap::with_capacity(1);
    if let Ok(val) = HeaderValue::from_str(code) {
        headers.insert(HEADER_X_AVISO_ERROR_CODE, val);
    }

    (status, headers, Json(ErrorResponse { error: message })).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::invalid_input("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::denied("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyError::internal("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_credential_error_is_invalid_input() {
        let err: ProxyError = CredentialError::Missing.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ProxyError::denied("no matching permission").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(HEADER_X_AVISO_ERROR_CODE).unwrap(),
            "authorization_denied"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "no matching permission");
    }
}
