//! Permission decision engine.
//!
//! Decides whether a credential may read a requested key range. A query is
//! allowed only when the whole requested interval lies inside the interval
//! granted by one permitted prefix, `[prefix, prefix_range_end(prefix))`.
//! Partial overlaps, and intervals that straddle two adjacent grants, are
//! denied.
//!
//! ## Caching
//!
//! Two caches sit in front of the permission store, both keyed by the
//! credential fingerprint (which covers the secret):
//! - permission sets, long TTL
//! - decisions per `(fingerprint, key, range_end)`, shorter TTL so permission
//!   changes reach already-decided ranges within a bounded window
//!
//! A cached decision is only served while the permission set it was
//! evaluated against is still the one cached for the fingerprint. Once that
//! set expires or is replaced, every decision derived from it is ignored, so
//! a decision never outlives its permissions.

use std::{sync::Arc, time::Duration};

use aviso_credentials::{Credential, CredentialFingerprint};
use tracing::debug;

use crate::{
    cache::TtlCache,
    config::CacheConfig,
    context::RequestContext,
    error::{ProxyError, ProxyResult},
    permissions::{LookupError, PermissionSet, PermissionStore},
    range::{prefix_range_end, RangeQuery},
};

pub const REASON_NO_MATCH: &str = "no matching permission";
pub const REASON_UNKNOWN_IDENTITY: &str = "unknown identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            outcome: Outcome::Allow,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            reason: Some(reason.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// Convert a deny into the error the frontend maps to 403.
    pub fn into_result(self) -> ProxyResult<()> {
        match self.outcome {
            Outcome::Allow => Ok(()),
            Outcome::Deny => Err(ProxyError::Denied(
                self.reason.unwrap_or_else(|| REASON_NO_MATCH.to_string()),
            )),
        }
    }
}

/// Whether the prefix grant covers the requested range.
///
/// Point reads (`range_end` empty) need `key` to start with `prefix`. Ranges
/// need `prefix <= key` and `range_end <= prefix_range_end(prefix)`, where an
/// empty upper bound is unbounded.
pub fn prefix_covers(prefix: &[u8], key: &[u8], range_end: &[u8]) -> bool {
    if range_end.is_empty() {
        return key.starts_with(prefix);
    }
    if key < prefix {
        return false;
    }
    let upper = prefix_range_end(prefix);
    upper.is_empty() || range_end <= upper.as_slice()
}

/// Pure decision over an already-resolved permission set. First match wins.
pub fn evaluate(permissions: &PermissionSet, key: &[u8], range_end: &[u8]) -> Decision {
    if permissions
        .prefixes()
        .iter()
        .any(|prefix| prefix_covers(prefix, key, range_end))
    {
        Decision::allow()
    } else {
        Decision::deny(REASON_NO_MATCH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    fingerprint: CredentialFingerprint,
    key: Vec<u8>,
    range_end: Vec<u8>,
}

/// A cached decision and the permission set it was evaluated against.
#[derive(Debug, Clone)]
struct CachedDecision {
    decision: Decision,
    permissions: Arc<PermissionSet>,
}

/// Result of [`Authoriser::authorise`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// Identity the permission store resolved the credential to. `None` when
    /// the store does not know the credential.
    pub identity: Option<String>,
}

impl Verdict {
    fn resolved(decision: Decision, permissions: &PermissionSet) -> Self {
        Self {
            decision,
            identity: Some(permissions.identity().to_string()),
        }
    }

    fn unknown_identity() -> Self {
        Self {
            decision: Decision::deny(REASON_UNKNOWN_IDENTITY),
            identity: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

pub struct Authoriser {
    store: Arc<dyn PermissionStore>,
    permission_cache: TtlCache<CredentialFingerprint, Arc<PermissionSet>>,
    decision_cache: TtlCache<DecisionKey, CachedDecision>,
}

impl Authoriser {
    pub fn new(store: Arc<dyn PermissionStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            permission_cache: TtlCache::new(
                "permissions",
                Duration::from_secs(config.permission_ttl_secs),
                config.permission_max_entries,
            ),
            decision_cache: TtlCache::new(
                "decisions",
                Duration::from_secs(config.decision_ttl_secs),
                config.decision_max_entries,
            ),
        }
    }

    /// Decide whether `credential` may read exactly the interval in `query`.
    ///
    /// Returns `Err(InvalidInput)` for an empty key or inverted range and
    /// `Err(Internal)` when the permission store cannot be reached; an
    /// unreachable store is never reported as a deny.
    pub async fn authorise(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
        query: &RangeQuery,
    ) -> ProxyResult<Verdict> {
        query.validate()?;

        let fingerprint = credential.fingerprint();
        let decision_key = DecisionKey {
            fingerprint: fingerprint.clone(),
            key: query.key.clone(),
            range_end: query.range_end.clone(),
        };

        let permissions = match self.permission_cache.get(&fingerprint) {
            Some(permissions) => {
                // A decision only counts while the set it came from is still cached.
                if let Some(cached) = self.decision_cache.get(&decision_key) {
                    if Arc::ptr_eq(&cached.permissions, &permissions) {
                        debug!(
                            request_id = %ctx.request_id,
                            outcome = ?cached.decision.outcome,
                            "Decision cache hit"
                        );
                        return Ok(Verdict::resolved(cached.decision, &permissions));
                    }
                }
                permissions
            }
            None => match self.fetch_permissions(ctx, credential, &fingerprint).await? {
                Some(permissions) => permissions,
                None => return Ok(Verdict::unknown_identity()),
            },
        };

        let decision = evaluate(&permissions, &query.key, &query.range_end);
        debug!(
            request_id = %ctx.request_id,
            identity = %permissions.identity(),
            outcome = ?decision.outcome,
            "Evaluated permission set"
        );
        self.decision_cache.insert(
            decision_key,
            CachedDecision {
                decision: decision.clone(),
                permissions: Arc::clone(&permissions),
            },
        );
        Ok(Verdict::resolved(decision, &permissions))
    }

    /// Ask the store and cache the answer. `None` means the store does not
    /// know this credential; nothing is cached for it.
    async fn fetch_permissions(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
        fingerprint: &CredentialFingerprint,
    ) -> ProxyResult<Option<Arc<PermissionSet>>> {
        match self.store.lookup(ctx, credential).await {
            Ok(permissions) => {
                let permissions = Arc::new(permissions);
                self.permission_cache
                    .insert(fingerprint.clone(), Arc::clone(&permissions));
                Ok(Some(permissions))
            }
            Err(LookupError::NotFound) => Ok(None),
            Err(LookupError::Unavailable(message)) => Err(ProxyError::Internal(message)),
        }
    }
}
