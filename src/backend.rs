//! Backend store adapter.
//!
//! Forwards authorised request bodies byte-for-byte to the backend's JSON
//! gateway and translates failures into [`ProxyError`]s. Backend error text
//! is logged but never relayed, with one exception: a request for a compacted
//! revision becomes a client-facing "History not available".

use std::time::Duration;

use axum::{body::Body, http::header::CONTENT_TYPE};
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::{
    config::BackendConfig,
    context::RequestContext,
    error::{ProxyError, ProxyResult},
};

pub const HISTORY_NOT_AVAILABLE: &str = "History not available";
pub const BACKEND_CONNECT_ERROR: &str = "Error connecting to backend";
pub const BACKEND_STATUS_ERROR: &str = "Backend returned an error";

/// Longest backend error body echoed into our own logs.
const MAX_LOGGED_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct BackendAdapter {
    client: reqwest::Client,
    streaming_client: reqwest::Client,
    range_url: String,
    watch_url: String,
    timeout: Duration,
}

impl BackendAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        // Watch responses are open-ended streams; only connecting and the
        // response head are bounded.
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        let base = config.url.trim_end_matches('/');
        Ok(Self {
            client,
            streaming_client,
            range_url: format!("{}{}", base, config.range_route),
            watch_url: format!("{}{}", base, config.watch_route),
            timeout,
        })
    }

    /// Forward a range request and return the backend's body unmodified.
    pub async fn forward(&self, ctx: &RequestContext, body: Bytes) -> ProxyResult<Bytes> {
        debug!(request_id = %ctx.request_id, url = %self.range_url, "Forwarding range request");

        let res = self
            .client
            .post(&self.range_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| connection_error(ctx, &e))?;

        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| connection_error(ctx, &e))?;

        if status.is_success() {
            Ok(bytes)
        } else {
            Err(translate_error(ctx, status, &bytes))
        }
    }

    /// Forward a watch request and stream the backend's response through.
    pub async fn forward_watch(&self, ctx: &RequestContext, body: Bytes) -> ProxyResult<Body> {
        debug!(request_id = %ctx.request_id, url = %self.watch_url, "Forwarding watch request");

        let send = self
            .streaming_client
            .post(&self.watch_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let res = match tokio::time::timeout(self.timeout, send).await {
            Ok(result) => result.map_err(|e| connection_error(ctx, &e))?,
            Err(_) => {
                warn!(request_id = %ctx.request_id, "Backend watch timed out before responding");
                metrics::counter!("aviso_auth_backend_errors_total", "kind" => "timeout")
                    .increment(1);
                return Err(ProxyError::internal(BACKEND_CONNECT_ERROR));
            }
        };

        let status = res.status();
        if !status.is_success() {
            let bytes = res.bytes().await.map_err(|e| connection_error(ctx, &e))?;
            return Err(translate_error(ctx, status, &bytes));
        }

        Ok(Body::from_stream(res.bytes_stream()))
    }
}

fn connection_error(ctx: &RequestContext, err: &reqwest::Error) -> ProxyError {
    let kind = if err.is_timeout() { "timeout" } else { "connect" };
    error!(request_id = %ctx.request_id, kind = kind, error = %err, "Backend request failed");
    metrics::counter!("aviso_auth_backend_errors_total", "kind" => kind).increment(1);
    ProxyError::internal(BACKEND_CONNECT_ERROR)
}

/// Map a non-2xx backend answer onto the proxy's taxonomy.
pub fn translate_error(ctx: &RequestContext, status: StatusCode, body: &[u8]) -> ProxyError {
    if status == StatusCode::BAD_REQUEST && is_compacted(body) {
        debug!(request_id = %ctx.request_id, "Requested revision has been compacted");
        metrics::counter!("aviso_auth_backend_errors_total", "kind" => "compacted").increment(1);
        return ProxyError::invalid_input(HISTORY_NOT_AVAILABLE);
    }

    let shown = &body[..body.len().min(MAX_LOGGED_BODY)];
    warn!(
        request_id = %ctx.request_id,
        status = %status,
        body = %String::from_utf8_lossy(shown),
        "Backend returned error status"
    );
    metrics::counter!("aviso_auth_backend_errors_total", "kind" => "status").increment(1);
    ProxyError::internal(BACKEND_STATUS_ERROR)
}

#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// The backend reports compaction as `mvcc: required revision has been compacted`.
fn is_compacted(body: &[u8]) -> bool {
    let Ok(parsed) = serde_json::from_slice::<BackendErrorBody>(body) else {
        return false;
    };
    [parsed.error, parsed.message]
        .iter()
        .flatten()
        .any(|text| text.to_ascii_lowercase().contains("compacted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("test")
    }

    const COMPACTED: &str = r#"{"error":"etcdserver: mvcc: required revision has been compacted","code":11,"message":"etcdserver: mvcc: required revision has been compacted"}"#;

    #[test]
    fn test_compacted_is_invalid_input() {
        let err = translate_error(&ctx(), StatusCode::BAD_REQUEST, COMPACTED.as_bytes());
        assert_eq!(err, ProxyError::InvalidInput(HISTORY_NOT_AVAILABLE.to_string()));
    }

    #[test]
    fn test_compacted_only_on_400() {
        let err = translate_error(
            &ctx(),
            StatusCode::INTERNAL_SERVER_ERROR,
            COMPACTED.as_bytes(),
        );
        assert!(matches!(err, ProxyError::Internal(_)));
    }

    #[test]
    fn test_other_400_is_internal_and_not_leaked() {
        let body = br#"{"error":"etcdserver: secret internal detail","code":3}"#;
        let err = translate_error(&ctx(), StatusCode::BAD_REQUEST, body);
        assert_eq!(err, ProxyError::Internal(BACKEND_STATUS_ERROR.to_string()));
    }

    #[test]
    fn test_non_json_error_body() {
        let err = translate_error(&ctx(), StatusCode::BAD_REQUEST, b"Bad Request");
        assert!(matches!(err, ProxyError::Internal(_)));
    }

    #[test]
    fn test_is_compacted_message_only() {
        assert!(is_compacted(br#"{"message":"required revision has been compacted"}"#));
        assert!(!is_compacted(br#"{"message":"key not found"}"#));
    }

    #[test]
    fn test_urls_joined_without_double_slash() {
        let config = BackendConfig {
            url: "http://etcd:2379/".to_string(),
            ..Default::default()
        };
        let adapter = BackendAdapter::new(&config).unwrap();
        assert_eq!(adapter.range_url, "http://etcd:2379/v3/kv/range");
        assert_eq!(adapter.watch_url, "http://etcd:2379/v3/watch");
    }
}
