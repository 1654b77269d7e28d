//! Shared fixtures: a scriptable mock backend and a counting permission store.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use aviso_auth::{
    authoriser::Authoriser,
    backend::BackendAdapter,
    config::{BackendConfig, CacheConfig},
    context::RequestContext,
    permissions::{
        LookupError, PermissionSet, PermissionStore, StaticPermissionStore, TokenRecord,
        UserRecord,
    },
    ProxyState,
};
use aviso_credentials::{AuthScheme, Credential};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::net::TcpListener;

pub const ALICE: &str = "alice@example.com";
pub const ALICE_KEY: &str = "alice-key";
pub const ALICE_TOKEN: &str = "alice-openid-token";

pub const RANGE_OK: &str =
    r#"{"header":{"revision":"7"},"kvs":[{"key":"L2RpZmYvZm9vL2E=","value":"eyJ4IjoxfQ=="}],"count":"1"}"#;
pub const COMPACTED: &str = r#"{"error":"etcdserver: mvcc: required revision has been compacted","code":11}"#;

/// How the mock backend answers.
#[derive(Debug, Clone)]
pub enum BackendBehavior {
    Ok(&'static str),
    Status(StatusCode, &'static str),
    Delay(Duration),
}

#[derive(Debug)]
pub struct MockBackend {
    pub addr: SocketAddr,
    behavior: Mutex<BackendBehavior>,
    calls: AtomicUsize,
    last_body: Mutex<Option<Bytes>>,
}

impl MockBackend {
    pub async fn start(behavior: BackendBehavior) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Arc::new(Self {
            addr: listener.local_addr().unwrap(),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            last_body: Mutex::new(None),
        });

        let app = Router::new()
            .route("/v3/kv/range", post(mock_handler))
            .route("/v3/watch", post(mock_handler))
            .with_state(backend.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        backend
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Option<Bytes> {
        self.last_body.lock().unwrap().clone()
    }

    pub fn set_behavior(&self, behavior: BackendBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

async fn mock_handler(State(backend): State<Arc<MockBackend>>, body: Bytes) -> Response {
    backend.calls.fetch_add(1, Ordering::SeqCst);
    *backend.last_body.lock().unwrap() = Some(body);
    let behavior = backend.behavior.lock().unwrap().clone();
    match behavior {
        BackendBehavior::Ok(text) => (StatusCode::OK, text).into_response(),
        BackendBehavior::Status(status, text) => (status, text).into_response(),
        BackendBehavior::Delay(delay) => {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, RANGE_OK).into_response()
        }
    }
}

/// Static store that counts lookups.
pub struct CountingStore {
    inner: StaticPermissionStore,
    lookups: AtomicUsize,
}

impl CountingStore {
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionStore for CountingStore {
    async fn lookup(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<PermissionSet, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(ctx, credential).await
    }
}

/// Alice may read everything under `/diss/foo/`.
pub fn alice_store() -> Arc<CountingStore> {
    let secret = Credential::new(AuthScheme::EmailKey, ALICE, ALICE_KEY).secret_sha256();
    let token = Credential::new(AuthScheme::OpenId, "", ALICE_TOKEN).secret_sha256();
    Arc::new(CountingStore {
        inner: StaticPermissionStore::new(
            vec![UserRecord {
                identity: ALICE.to_string(),
                secret_sha256: secret,
                prefixes: vec!["/diss/foo/".to_string()],
            }],
            vec![TokenRecord {
                token_sha256: token,
                identity: ALICE.to_string(),
            }],
        ),
        lookups: AtomicUsize::new(0),
    })
}

pub fn backend_config(url: String) -> BackendConfig {
    BackendConfig {
        url,
        timeout_secs: 1,
        connect_timeout_secs: 1,
        ..Default::default()
    }
}

pub fn proxy_state(store: Arc<CountingStore>, backend: &BackendConfig) -> Arc<ProxyState> {
    Arc::new(ProxyState::new(
        Authoriser::new(store, &CacheConfig::default()),
        BackendAdapter::new(backend).unwrap(),
    ))
}
