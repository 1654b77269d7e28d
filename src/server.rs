//! Frontend pipeline.
//!
//! Every proxied request runs through the same stages:
//! 1. Credential extraction from the `Authorization` header
//! 2. Body decoding into a [`RangeQuery`]
//! 3. Authorisation of the exact `[key, range_end)` interval
//! 4. Forwarding of the untouched body to the backend
//! 5. Relaying the backend's answer
//!
//! The first failing stage ends the request. This module is the only place
//! that turns errors into HTTP statuses and picks the log severity for them.

use std::sync::Arc;

use aviso_credentials::extract_credential;
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    authoriser::Authoriser,
    backend::BackendAdapter,
    config::{PermissionStoreConfig, ProxyConfig, ServerConfig},
    context::{RequestContext, Stage, REQUEST_ID_HEADER},
    error::{ProxyError, ProxyResult},
    metrics::Metrics,
    permissions::{EtcdPermissionStore, PermissionStore, StaticPermissionStore},
    range::RangeQuery,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Range,
    Watch,
}

impl RouteKind {
    fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Range => "range",
            RouteKind::Watch => "watch",
        }
    }
}

/// Shared components, one instance per process.
pub struct ProxyState {
    authoriser: Authoriser,
    backend: BackendAdapter,
}

impl ProxyState {
    pub fn new(authoriser: Authoriser, backend: BackendAdapter) -> Self {
        Self {
            authoriser,
            backend,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, reqwest::Error> {
        let store: Arc<dyn PermissionStore> = match &config.permissions {
            PermissionStoreConfig::Etcd {
                namespace,
                timeout_secs,
                ..
            } => Arc::new(EtcdPermissionStore::new(
                config.permission_store_url(),
                &config.backend.range_route,
                namespace,
                std::time::Duration::from_secs(*timeout_secs),
            )?),
            PermissionStoreConfig::Static { users, tokens } => {
                Arc::new(StaticPermissionStore::new(users.clone(), tokens.clone()))
            }
        };

        Ok(Self::new(
            Authoriser::new(store, &config.cache),
            BackendAdapter::new(&config.backend)?,
        ))
    }

    async fn handle(
        &self,
        ctx: &mut RequestContext,
        kind: RouteKind,
        headers: &HeaderMap,
        body: Bytes,
    ) -> ProxyResult<Response> {
        let credential = extract_credential(headers)?;
        ctx.set_identity(credential.display_identity());
        ctx.advance(Stage::CredentialExtracted);

        let query = match kind {
            RouteKind::Range => RangeQuery::decode(&body)?,
            RouteKind::Watch => RangeQuery::decode_watch(&body)?,
        };
        ctx.advance(Stage::RangeDecoded);

        let verdict = self.authoriser.authorise(ctx, &credential, &query).await?;
        if let Some(identity) = &verdict.identity {
            ctx.set_identity(identity.as_str());
        }
        verdict.decision.into_result()?;
        ctx.advance(Stage::Authorised);

        // The body forwarded is the body that was decoded and authorised.
        let response_body = match kind {
            RouteKind::Range => Body::from(self.backend.forward(ctx, body).await?),
            RouteKind::Watch => self.backend.forward_watch(ctx, body).await?,
        };
        ctx.advance(Stage::Forwarded);

        let mut response = Response::new(response_body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ctx.advance(Stage::ResponseTranslated);
        Ok(response)
    }
}

pub fn build_app(state: Arc<ProxyState>, config: &ProxyConfig) -> Router {
    Router::new()
        .route(&config.backend.range_route, post(range_handler))
        .route(&config.backend.watch_route, post(watch_handler))
        .route("/health", get(health_handler))
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn range_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, RouteKind::Range, headers, body).await
}

async fn watch_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, RouteKind::Watch, headers, body).await
}

async fn health_handler() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn proxy(
    state: Arc<ProxyState>,
    kind: RouteKind,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut ctx = RequestContext::from_headers(&headers);
    let result = state.handle(&mut ctx, kind, &headers, body).await;
    reply(&ctx, kind, result)
}

/// Turn the pipeline result into the reply, with one log line per request.
fn reply(ctx: &RequestContext, kind: RouteKind, result: ProxyResult<Response>) -> Response {
    let latency = ctx.elapsed();
    let latency_ms = latency.as_millis() as u64;

    let (mut response, outcome) = match result {
        Ok(response) => (response, "allow"),
        Err(err) => {
            let outcome = err.outcome();
            match &err {
                ProxyError::Internal(message) => warn!(
                    request_id = %ctx.request_id,
                    identity = %ctx.identity(),
                    route = kind.as_str(),
                    stage = ctx.stage().as_str(),
                    error = %message,
                    "Request failed on infrastructure error"
                ),
                ProxyError::InvalidInput(message) | ProxyError::Denied(message) => info!(
                    request_id = %ctx.request_id,
                    identity = %ctx.identity(),
                    route = kind.as_str(),
                    stage = ctx.stage().as_str(),
                    reason = %message,
                    "Request rejected"
                ),
            }
            (err.into_response(), outcome)
        }
    };

    info!(
        request_id = %ctx.request_id,
        identity = %ctx.identity(),
        route = kind.as_str(),
        outcome = outcome,
        status = response.status().as_u16(),
        latency_ms = latency_ms,
        "Request completed"
    );
    Metrics::record_request(kind.as_str(), outcome, latency);

    if let Ok(val) = HeaderValue::from_str(&ctx.request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Bind and serve until ctrl-c.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let state = Arc::new(ProxyState::from_config(&config)?);
    let app = build_app(state, &config);

    let listener = bind_listener(&config.server).await?;
    info!(
        "Aviso auth proxy listening on {}, forwarding to {}",
        listener.local_addr()?,
        config.backend.url
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Aviso auth proxy stopped");
    Ok(())
}

/// Bind the listen socket. `host` may be a name, resolved at startup.
pub async fn bind_listener(config: &ServerConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port)).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use aviso_credentials::{AuthScheme, Credential};
    use axum::http::header::AUTHORIZATION;

    use super::*;
    use crate::{
        config::{BackendConfig, CacheConfig},
        permissions::{TokenRecord, UserRecord},
        range::encode_key,
    };

    fn bearer_state() -> ProxyState {
        let store = StaticPermissionStore::new(
            vec![UserRecord {
                identity: "alice@example.com".to_string(),
                secret_sha256: String::new(),
                prefixes: vec!["/diss/foo/".to_string()],
            }],
            vec![TokenRecord {
                token_sha256: Credential::new(AuthScheme::OpenId, "", "tok").secret_sha256(),
                identity: "alice@example.com".to_string(),
            }],
        );
        // Nothing listens on port 1, so forwarding fails after authorisation.
        let backend = BackendConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            connect_timeout_secs: 1,
            ..Default::default()
        };
        ProxyState::new(
            Authoriser::new(Arc::new(store), &CacheConfig::default()),
            BackendAdapter::new(&backend).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_bearer_identity_resolved_into_context() {
        let state = bearer_state();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        let body = Bytes::from(format!(r#"{{"key":"{}"}}"#, encode_key(b"/diss/foo/a")));

        for _ in 0..2 {
            let mut ctx = RequestContext::new("r");
            let result = state
                .handle(&mut ctx, RouteKind::Range, &headers, body.clone())
                .await;
            assert!(matches!(result, Err(ProxyError::Internal(_))));
            assert_eq!(ctx.stage(), Stage::Authorised);
            assert_eq!(ctx.identity(), "alice@example.com");
        }
    }

    #[tokio::test]
    async fn test_unknown_bearer_keeps_placeholder_identity() {
        let state = bearer_state();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer other"));
        let body = Bytes::from(format!(r#"{{"key":"{}"}}"#, encode_key(b"/diss/foo/a")));

        let mut ctx = RequestContext::new("r");
        let result = state.handle(&mut ctx, RouteKind::Range, &headers, body).await;
        assert!(matches!(result, Err(ProxyError::Denied(_))));
        assert_eq!(ctx.identity(), "<bearer>");
    }

    #[tokio::test]
    async fn test_bind_listener_resolves_host_name() {
        let config = ServerConfig {
            host: "localhost".to_string(),
            port: 0,
            ..Default::default()
        };
        let listener = bind_listener(&config).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_listener_accepts_ip_literal() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let listener = bind_listener(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
