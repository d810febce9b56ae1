//! Identity keys and request identity extraction.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Header carrying the original client chain when behind a proxy.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header carrying the client address set by some proxies.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// The class of identity a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Client network address
    Ip,
    /// Presented API credential
    Token,
}

impl Scope {
    /// Namespace used when building storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Token => "token",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one rate-limited subject.
///
/// The same literal value under two scopes names two different subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// The identity class
    pub scope: Scope,
    /// The literal address or credential
    pub value: String,
}

impl IdentityKey {
    /// Create a new identity key.
    pub fn new(scope: Scope, value: &str) -> Self {
        Self {
            scope,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.value)
    }
}

/// The identity candidates pulled from one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Credential presented in the configured header, if any
    pub credential: Option<String>,
    /// Best-effort client address
    pub address: String,
}

impl RequestIdentity {
    /// Build an identity directly, mostly useful in tests.
    pub fn new(credential: Option<&str>, address: &str) -> Self {
        Self {
            credential: credential.map(str::to_string),
            address: address.to_string(),
        }
    }

    /// Extract the credential and client address from request parts.
    ///
    /// The address prefers the first `X-Forwarded-For` entry, then
    /// `X-Real-IP`, then the transport peer.
    pub fn extract(headers: &HeaderMap, peer: Option<SocketAddr>, credential_header: &str) -> Self {
        let credential = header_str(headers, credential_header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let address = header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|xff| xff.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                header_str(headers, REAL_IP_HEADER)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            credential,
            address,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.9:54321".parse().unwrap())
    }

    #[test]
    fn test_identity_key_display() {
        let key = IdentityKey::new(Scope::Ip, "1.2.3.4");
        assert_eq!(key.to_string(), "ip:1.2.3.4");
    }

    #[test]
    fn test_scopes_do_not_collide() {
        let ip = IdentityKey::new(Scope::Ip, "abc");
        let token = IdentityKey::new(Scope::Token, "abc");
        assert_ne!(ip, token);
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static(" 203.0.113.7 , 10.1.1.1"),
        );
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static("198.51.100.2"));

        let identity = RequestIdentity::extract(&headers, peer(), "API_KEY");
        assert_eq!(identity.address, "203.0.113.7");
        assert_eq!(identity.credential, None);
    }

    #[test]
    fn test_real_ip_before_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static("198.51.100.2"));

        let identity = RequestIdentity::extract(&headers, peer(), "API_KEY");
        assert_eq!(identity.address, "198.51.100.2");
    }

    #[test]
    fn test_peer_address_fallback() {
        let identity = RequestIdentity::extract(&HeaderMap::new(), peer(), "API_KEY");
        assert_eq!(identity.address, "10.0.0.9");

        let identity = RequestIdentity::extract(&HeaderMap::new(), None, "API_KEY");
        assert_eq!(identity.address, "unknown");
    }

    #[test]
    fn test_credential_is_trimmed_and_blank_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("  abc123 "));
        let identity = RequestIdentity::extract(&headers, peer(), "API_KEY");
        assert_eq!(identity.credential.as_deref(), Some("abc123"));

        let mut headers = HeaderMap::new();
        headers.insert("api_key", HeaderValue::from_static("   "));
        let identity = RequestIdentity::extract(&headers, peer(), "API_KEY");
        assert_eq!(identity.credential, None);
    }
}
