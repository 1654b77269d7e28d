use std::fmt;

use sha2::{Digest, Sha256};

/// Authentication scheme a credential was presented with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    /// `EmailKey <email>:<key>`, the key is checked against a stored per-user key.
    EmailKey,
    /// `Bearer <token>`, the identity is resolved from the token by the permission store.
    OpenId,
    /// `Basic <base64(user:pass)>`.
    Plain,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::EmailKey => "emailkey",
            AuthScheme::OpenId => "openid",
            AuthScheme::Plain => "plain",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential presented on one request. Never persisted.
///
/// For [`AuthScheme::OpenId`] the `identity` is empty: the token is opaque
/// and only the permission store can resolve who it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: AuthScheme,
    pub identity: String,
    pub secret: String,
}

impl Credential {
    pub fn new(scheme: AuthScheme, identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            scheme,
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    /// Lowercase hex SHA-256 of the secret, the form permission stores keep.
    pub fn secret_sha256(&self) -> String {
        format!("{:x}", Sha256::digest(self.secret.as_bytes()))
    }

    /// Name to report in logs. Bearer tokens have no local identity.
    pub fn display_identity(&self) -> &str {
        if self.identity.is_empty() {
            "<bearer>"
        } else {
            &self.identity
        }
    }

    pub fn fingerprint(&self) -> CredentialFingerprint {
        CredentialFingerprint {
            scheme: self.scheme,
            identity: self.identity.clone(),
            secret_digest: Sha256::digest(self.secret.as_bytes()).into(),
        }
    }
}

// Secrets must never reach a log line.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Cache key derived from a credential.
///
/// Includes a digest of the secret so that an entry populated by a valid
/// credential is never served to a request carrying the same identity with a
/// different secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialFingerprint {
    pub scheme: AuthScheme,
    pub identity: String,
    secret_digest: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let cred = Credential::new(AuthScheme::EmailKey, "alice@example.com", "s3cr3t");
        let printed = format!("{:?}", cred);
        assert!(printed.contains("alice@example.com"));
        assert!(!printed.contains("s3cr3t"));
    }

    #[test]
    fn test_secret_sha256_known_vector() {
        // Contains the byte 0x01, which must render as "01".
        let cred = Credential::new(AuthScheme::Plain, "bob", "abc");
        assert_eq!(
            cred.secret_sha256(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_secret_sha256_empty_secret() {
        let digest = Credential::new(AuthScheme::Plain, "bob", "").secret_sha256();
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_secrets() {
        let a = Credential::new(AuthScheme::Plain, "bob", "one").fingerprint();
        let b = Credential::new(AuthScheme::Plain, "bob", "two").fingerprint();
        let c = Credential::new(AuthScheme::Plain, "bob", "one").fingerprint();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_fingerprint_distinguishes_schemes() {
        let a = Credential::new(AuthScheme::Plain, "bob@x.org", "k").fingerprint();
        let b = Credential::new(AuthScheme::EmailKey, "bob@x.org", "k").fingerprint();
        assert_ne!(a, b);
    }
}
