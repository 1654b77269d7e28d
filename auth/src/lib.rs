//! Credential extraction for the Aviso authorizing proxy.
//!
//! This crate provides:
//! - The closed set of accepted authentication schemes ([`AuthScheme`])
//! - A typed, request-scoped [`Credential`] parsed from the `Authorization` header
//! - A [`CredentialFingerprint`] safe to use as a cache key (secrets are hashed)

mod credential;
mod extract;

pub use credential::{AuthScheme, Credential, CredentialFingerprint};
pub use extract::{
    extract_credential, parse_authorization, CredentialError, AUTH_TYPE_HEADER, OPENID_MARKER,
};

/// Request ID for correlation in logs.
///
/// Taken from the inbound `X-Request-Id` header when present, generated
/// otherwise, and threaded through every component call for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
