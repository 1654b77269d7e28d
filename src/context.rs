//! Per-request context threaded by reference through every component call.

use std::time::{Duration, Instant};

use aviso_credentials::RequestId;
use axum::http::HeaderMap;
use tracing::debug;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request lifecycle. Each request ends at the first stage that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    CredentialExtracted,
    RangeDecoded,
    Authorised,
    Forwarded,
    ResponseTranslated,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::CredentialExtracted => "credential_extracted",
            Stage::RangeDecoded => "range_decoded",
            Stage::Authorised => "authorised",
            Stage::Forwarded => "forwarded",
            Stage::ResponseTranslated => "response_translated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    identity: Option<String>,
    stage: Stage,
    started: Instant,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId(request_id.into()),
            identity: None,
            stage: Stage::Received,
            started: Instant::now(),
        }
    }

    /// Reuse the caller's `X-Request-Id` when it is printable, otherwise mint one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let inbound = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128);

        match inbound {
            Some(id) => Self::new(id),
            None => Self::new(Uuid::new_v4().to_string()),
        }
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or("-")
    }

    pub fn advance(&mut self, stage: Stage) {
        debug!(request_id = %self.request_id, stage = stage.as_str(), "Pipeline stage reached");
        self.stage = stage;
    }

    /// Last stage the request completed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_request_id_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.request_id.0, "abc-123");
    }

    #[test]
    fn test_request_id_generated() {
        let ctx = RequestContext::from_headers(&HeaderMap::new());
        assert!(Uuid::parse_str(&ctx.request_id.0).is_ok());
    }

    #[test]
    fn test_identity_placeholder() {
        let mut ctx = RequestContext::new("r");
        assert_eq!(ctx.identity(), "-");
        ctx.set_identity("alice@example.com");
        assert_eq!(ctx.identity(), "alice@example.com");
    }

    #[test]
    fn test_stage_advances() {
        let mut ctx = RequestContext::new("r");
        assert_eq!(ctx.stage(), Stage::Received);
        ctx.advance(Stage::CredentialExtracted);
        assert_eq!(ctx.stage(), Stage::CredentialExtracted);
    }
}
