//! `Authorization` header parsing.
//!
//! One parse function per scheme, selected by the leading scheme token.
//! Unknown scheme tokens are rejected rather than falling through.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header::AUTHORIZATION, HeaderMap};
use thiserror::Error;

use crate::credential::{AuthScheme, Credential};

/// Companion header qualifying a bearer token.
pub const AUTH_TYPE_HEADER: &str = "x-auth-type";

/// The only bearer qualifier accepted.
pub const OPENID_MARKER: &str = "openid";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Missing Authorization header")]
    Missing,

    #[error("Malformed Authorization header: {0}")]
    Malformed(&'static str),

    #[error("Unsupported authorization scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Extract the credential from a request's headers.
pub fn extract_credential(headers: &HeaderMap) -> Result<Credential, CredentialError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(CredentialError::Missing)?
        .to_str()
        .map_err(|_| CredentialError::Malformed("header is not valid ASCII"))?;

    let auth_type = match headers.get(AUTH_TYPE_HEADER) {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| CredentialError::Malformed("auth type is not valid ASCII"))?,
        ),
        None => None,
    };

    parse_authorization(value, auth_type)
}

/// Parse a raw `Authorization` header value.
///
/// `auth_type` is the value of the companion [`AUTH_TYPE_HEADER`], which only
/// matters for bearer tokens.
pub fn parse_authorization(
    value: &str,
    auth_type: Option<&str>,
) -> Result<Credential, CredentialError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CredentialError::Missing);
    }

    let (scheme, rest) = value
        .split_once(char::is_whitespace)
        .ok_or(CredentialError::Malformed("expected '<scheme> <credentials>'"))?;
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(CredentialError::Malformed("empty credentials"));
    }

    if scheme.eq_ignore_ascii_case("emailkey") {
        parse_email_key(rest)
    } else if scheme.eq_ignore_ascii_case("bearer") {
        parse_bearer(rest, auth_type)
    } else if scheme.eq_ignore_ascii_case("basic") {
        parse_basic(rest)
    } else {
        Err(CredentialError::UnsupportedScheme(scheme.to_string()))
    }
}

fn parse_email_key(rest: &str) -> Result<Credential, CredentialError> {
    let (email, key) = rest
        .split_once(':')
        .ok_or(CredentialError::Malformed("expected '<email>:<key>'"))?;
    if email.is_empty() || key.is_empty() {
        return Err(CredentialError::Malformed("email and key must be non-empty"));
    }
    if !email.contains('@') {
        return Err(CredentialError::Malformed("identity is not an email address"));
    }
    Ok(Credential::new(AuthScheme::EmailKey, email, key))
}

fn parse_bearer(token: &str, auth_type: Option<&str>) -> Result<Credential, CredentialError> {
    match auth_type.map(str::trim) {
        None => {}
        Some(marker) if marker.eq_ignore_ascii_case(OPENID_MARKER) => {}
        Some(other) => return Err(CredentialError::UnsupportedScheme(format!("bearer/{}", other))),
    }
    if token.contains(char::is_whitespace) {
        return Err(CredentialError::Malformed("bearer token contains whitespace"));
    }
    Ok(Credential::new(AuthScheme::OpenId, "", token))
}

fn parse_basic(encoded: &str) -> Result<Credential, CredentialError> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| CredentialError::Malformed("basic credentials are not valid base64"))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| CredentialError::Malformed("basic credentials are not valid UTF-8"))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or(CredentialError::Malformed("expected 'user:password'"))?;
    if user.is_empty() || pass.is_empty() {
        return Err(CredentialError::Malformed("user and password must be non-empty"));
    }
    Ok(Credential::new(AuthScheme::Plain, user, pass))
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_email_key() {
        let cred = parse_authorization("EmailKey alice@example.com:abc123", None).unwrap();
        assert_eq!(cred.scheme, AuthScheme::EmailKey);
        assert_eq!(cred.identity, "alice@example.com");
        assert_eq!(cred.secret, "abc123");
    }

    #[test]
    fn test_email_key_secret_may_contain_colon() {
        let cred = parse_authorization("EmailKey a@b.c:x:y", None).unwrap();
        assert_eq!(cred.secret, "x:y");
    }

    #[test]
    fn test_email_key_requires_email() {
        assert!(matches!(
            parse_authorization("EmailKey alice:abc", None),
            Err(CredentialError::Malformed(_))
        ));
        assert!(matches!(
            parse_authorization("EmailKey a@b.c:", None),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_basic() {
        // "bob:hunter2"
        let cred = parse_authorization("Basic Ym9iOmh1bnRlcjI=", None).unwrap();
        assert_eq!(cred.scheme, AuthScheme::Plain);
        assert_eq!(cred.identity, "bob");
        assert_eq!(cred.secret, "hunter2");
    }

    #[test]
    fn test_basic_scheme_is_case_insensitive() {
        let cred = parse_authorization("basic Ym9iOmh1bnRlcjI=", None).unwrap();
        assert_eq!(cred.identity, "bob");
    }

    #[test]
    fn test_basic_rejects_bad_base64() {
        assert!(matches!(
            parse_authorization("Basic !!!", None),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_basic_rejects_missing_separator() {
        // "bob"
        assert!(matches!(
            parse_authorization("Basic Ym9i", None),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_bearer_defaults_to_openid() {
        let cred = parse_authorization("Bearer tok.en-1", None).unwrap();
        assert_eq!(cred.scheme, AuthScheme::OpenId);
        assert_eq!(cred.secret, "tok.en-1");
        assert!(cred.identity.is_empty());
    }

    #[test]
    fn test_bearer_with_marker() {
        let cred = parse_authorization("Bearer abc", Some("OpenID")).unwrap();
        assert_eq!(cred.scheme, AuthScheme::OpenId);
    }

    #[test]
    fn test_bearer_with_unknown_marker() {
        assert!(matches!(
            parse_authorization("Bearer abc", Some("saml")),
            Err(CredentialError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_unknown_scheme() {
        assert_eq!(
            parse_authorization("Digest abc", None),
            Err(CredentialError::UnsupportedScheme("Digest".to_string()))
        );
    }

    #[test]
    fn test_missing_credentials_part() {
        assert!(matches!(
            parse_authorization("Basic", None),
            Err(CredentialError::Malformed(_))
        ));
        assert_eq!(parse_authorization("   ", None), Err(CredentialError::Missing));
    }

    #[test]
    fn test_extract_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers), Err(CredentialError::Missing));

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("EmailKey carol@example.com:k"),
        );
        let cred = extract_credential(&headers).unwrap();
        assert_eq!(cred.identity, "carol@example.com");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(AUTH_TYPE_HEADER, HeaderValue::from_static("openid"));
        assert_eq!(extract_credential(&headers).unwrap().scheme, AuthScheme::OpenId);
    }
}
