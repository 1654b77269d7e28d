//! Permission store clients.
//!
//! A permission store answers one question: given a presented credential,
//! which key prefixes may its owner read? Secrets are never stored, only their
//! SHA-256 digests, compared in constant time.
//!
//! Two implementations are provided:
//! - [`EtcdPermissionStore`]: records kept in the backend store itself under a
//!   reserved namespace (`<ns>users/<identity>`, `<ns>tokens/<sha256(token)>`)
//! - [`StaticPermissionStore`]: records supplied by configuration

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use aviso_credentials::{AuthScheme, Credential};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    context::RequestContext,
    range::{decode_key, encode_key},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// Unknown identity, unknown token or secret mismatch. Deliberately
    /// indistinguishable to the caller.
    #[error("unknown identity")]
    NotFound,

    #[error("permission store unavailable: {0}")]
    Unavailable(String),
}

/// Ordered set of key prefixes granted to one identity. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionSet {
    identity: String,
    prefixes: Vec<Vec<u8>>,
}

impl PermissionSet {
    /// Build a set, keeping first-insertion order. Duplicates are dropped, and
    /// so are empty prefixes: an empty prefix would grant the whole keyspace.
    pub fn new<I, P>(identity: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let identity = identity.into();
        let mut out: Vec<Vec<u8>> = Vec::new();
        for prefix in prefixes {
            let prefix = prefix.into();
            if prefix.is_empty() {
                warn!(identity = %identity, "Ignoring empty permission prefix");
                continue;
            }
            if !out.contains(&prefix) {
                out.push(prefix);
            }
        }
        Self {
            identity,
            prefixes: out,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn prefixes(&self) -> &[Vec<u8>] {
        &self.prefixes
    }
}

/// A user's stored record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserRecord {
    /// Implied by the record's key in the backend store; required in static configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity: String,
    /// Lowercase hex SHA-256 of the user's key or password.
    #[serde(default)]
    pub secret_sha256: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

impl UserRecord {
    fn permission_set(&self, identity: &str) -> PermissionSet {
        PermissionSet::new(identity, self.prefixes.iter().map(|p| p.as_bytes().to_vec()))
    }

    fn secret_matches(&self, credential: &Credential) -> bool {
        let presented = credential.secret_sha256();
        let stored = self.secret_sha256.trim().to_ascii_lowercase();
        bool::from(presented.as_bytes().ct_eq(stored.as_bytes()))
    }
}

/// Maps a bearer token digest to the identity it was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_sha256: String,
    pub identity: String,
}

#[async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    /// Verify `credential` and return the prefixes its owner may read.
    async fn lookup(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<PermissionSet, LookupError>;
}

/// Shared verification once records have been fetched.
fn verify_user(
    credential: &Credential,
    identity: &str,
    user: Option<UserRecord>,
) -> Result<PermissionSet, LookupError> {
    let user = user.ok_or(LookupError::NotFound)?;
    match credential.scheme {
        AuthScheme::EmailKey | AuthScheme::Plain => {
            if !user.secret_matches(credential) {
                return Err(LookupError::NotFound);
            }
        }
        // Possession of a registered token is the proof.
        AuthScheme::OpenId => {}
    }
    Ok(user.permission_set(identity))
}

// ============================================================================
// Static store
// ============================================================================

#[derive(Debug, Default)]
pub struct StaticPermissionStore {
    users: HashMap<String, UserRecord>,
    tokens: HashMap<String, String>,
}

impl StaticPermissionStore {
    pub fn new(users: Vec<UserRecord>, tokens: Vec<TokenRecord>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.identity.clone(), u))
                .collect(),
            tokens: tokens
                .into_iter()
                .map(|t| (t.token_sha256.trim().to_ascii_lowercase(), t.identity))
                .collect(),
        }
    }
}

#[async_trait]
impl PermissionStore for StaticPermissionStore {
    async fn lookup(
        &self,
        _ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<PermissionSet, LookupError> {
        let identity = match credential.scheme {
            AuthScheme::OpenId => self
                .tokens
                .get(&credential.secret_sha256())
                .cloned()
                .ok_or(LookupError::NotFound)?,
            AuthScheme::EmailKey | AuthScheme::Plain => credential.identity.clone(),
        };
        verify_user(credential, &identity, self.users.get(&identity).cloned())
    }
}

// ============================================================================
// Backend-store-backed store
// ============================================================================

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Clone)]
pub struct EtcdPermissionStore {
    client: reqwest::Client,
    range_url: String,
    namespace: String,
}

impl EtcdPermissionStore {
    pub fn new(
        base_url: &str,
        range_route: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut namespace = namespace.to_string();
        if !namespace.ends_with('/') {
            namespace.push('/');
        }
        Ok(Self {
            client,
            range_url: format!("{}{}", base_url.trim_end_matches('/'), range_route),
            namespace,
        })
    }

    fn user_key(&self, identity: &str) -> String {
        format!("{}users/{}", self.namespace, identity)
    }

    fn token_key(&self, token_sha256: &str) -> String {
        format!("{}tokens/{}", self.namespace, token_sha256)
    }

    /// Point-read one record and parse its JSON value.
    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<T>, LookupError> {
        let body = json!({ "key": encode_key(key.as_bytes()) });
        let res = self
            .client
            .post(&self.range_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(request_id = %ctx.request_id, error = %e, "Permission store request failed");
                LookupError::Unavailable("Error connecting to permission store".to_string())
            })?;

        if !res.status().is_success() {
            warn!(
                request_id = %ctx.request_id,
                status = %res.status(),
                "Permission store returned error status"
            );
            return Err(LookupError::Unavailable(format!(
                "permission store returned status {}",
                res.status().as_u16()
            )));
        }

        let parsed: RangeResponse = res.json().await.map_err(|e| {
            warn!(request_id = %ctx.request_id, error = %e, "Unreadable permission store response");
            LookupError::Unavailable("unreadable permission store response".to_string())
        })?;

        let Some(kv) = parsed.kvs.into_iter().next() else {
            debug!(request_id = %ctx.request_id, key = %key, "Permission record not found");
            return Ok(None);
        };

        let raw = decode_key(&kv.value).ok_or_else(|| {
            LookupError::Unavailable("permission record is not valid base64".to_string())
        })?;
        let record = serde_json::from_slice(&raw).map_err(|e| {
            warn!(request_id = %ctx.request_id, key = %key, error = %e, "Corrupt permission record");
            LookupError::Unavailable("corrupt permission record".to_string())
        })?;
        Ok(Some(record))
    }
}

#[async_trait]
impl PermissionStore for EtcdPermissionStore {
    async fn lookup(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<PermissionSet, LookupError> {
        let identity = match credential.scheme {
            AuthScheme::OpenId => {
                let token: TokenRecord = self
                    .fetch(ctx, &self.token_key(&credential.secret_sha256()))
                    .await?
                    .ok_or(LookupError::NotFound)?;
                token.identity
            }
            AuthScheme::EmailKey | AuthScheme::Plain => credential.identity.clone(),
        };
        let user: Option<UserRecord> = self.fetch(ctx, &self.user_key(&identity)).await?;
        verify_user(credential, &identity, user)
    }
}
