use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;

use crate::audit::AuditContext;
use crate::auth::AuthUser;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Bounded by the `audit_logs` column widths.
const MAX_REQUEST_ID_LEN: usize = 64;
const MAX_IP_LEN: usize = 50;
const MAX_USER_AGENT_CHARS: usize = 255;

/// Per-request caller metadata, set by [`crate::security::request_meta`].
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: String,
    pub source_ip: String,
    pub user_agent: String,
}

impl RequestMeta {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
            .map(|v| v.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            request_id,
            source_ip: client_ip(headers, peer),
            user_agent: user_agent(headers),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.trim())
}

// Non-ASCII agents are kept (lossily) and cut to the column width in chars.
fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .map(|v| {
            String::from_utf8_lossy(v.as_bytes())
                .trim()
                .chars()
                .take(MAX_USER_AGENT_CHARS)
                .collect()
        })
        .unwrap_or_default()
}

// Accepts only short address-shaped values (IPv4, IPv6, hostnames).
fn normalized_addr(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > MAX_IP_LEN {
        return None;
    }
    raw.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b':' || b == b'-')
        .then_some(raw)
}

// Proxy headers first, then the socket peer. Malformed proxy values are
// skipped rather than recorded.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .and_then(normalized_addr);
    let real = header_str(headers, "x-real-ip").and_then(normalized_addr);

    match forwarded.or(real) {
        Some(addr) => addr.to_string(),
        None => peer.map(|p| p.ip().to_string()).unwrap_or_default(),
    }
}

pub fn peer_addr(extensions: &axum::http::Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(meta) = parts.extensions.get::<RequestMeta>() {
            return Ok(meta.clone());
        }
        Ok(RequestMeta::from_headers(&parts.headers, peer_addr(&parts.extensions)))
    }
}

/// Audit context for the current request: the authenticated user (if any)
/// plus request metadata.
#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuditContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let meta = RequestMeta::from_request_parts(parts, state).await?;
        let actor_id = parts.extensions.get::<AuthUser>().map(|u| u.user_id);
        Ok(AuditContext {
            actor_id,
            request_id: meta.request_id,
            source_ip: meta.source_ip,
            user_agent: meta.user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("MedScreen-Android/2.1"));
        let peer = Some(SocketAddr::from(([10, 0, 0, 1], 5555)));

        let meta = RequestMeta::from_headers(&headers, peer);
        assert_eq!(meta.source_ip, "203.0.113.9");
        assert_eq!(meta.user_agent, "MedScreen-Android/2.1");
        assert!(!meta.request_id.is_empty());
    }

    #[test]
    fn falls_back_to_peer_address() {
        let peer = Some(SocketAddr::from(([192, 168, 1, 141], 40000)));
        let meta = RequestMeta::from_headers(&HeaderMap::new(), peer);
        assert_eq!(meta.source_ip, "192.168.1.141");
        assert_eq!(meta.user_agent, "");
    }

    #[test]
    fn oversized_headers_fit_audit_columns() {
        let mut headers = HeaderMap::new();
        let long_ua = "Mozilla/5.0 ".repeat(25);
        let long_xff = "1".repeat(60);
        headers.insert("user-agent", HeaderValue::from_str(&long_ua).unwrap());
        headers.insert("x-forwarded-for", HeaderValue::from_str(&long_xff).unwrap());
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(&"r".repeat(65)).unwrap());
        let peer = Some(SocketAddr::from(([10, 0, 0, 2], 4000)));

        let meta = RequestMeta::from_headers(&headers, peer);
        assert_eq!(meta.user_agent.chars().count(), 255);
        assert!(long_ua.starts_with(&meta.user_agent));
        assert_eq!(meta.source_ip, "10.0.0.2");
        assert!(meta.request_id.len() <= 64);
    }

    #[test]
    fn user_agent_is_cut_on_char_boundary() {
        let mut headers = HeaderMap::new();
        let ua = "\u{e9}".repeat(300);
        headers.insert("user-agent", HeaderValue::from_bytes(ua.as_bytes()).unwrap());

        let meta = RequestMeta::from_headers(&headers, None);
        assert_eq!(meta.user_agent.chars().count(), 255);
        assert!(meta.user_agent.chars().all(|c| c == '\u{e9}'));
    }

    #[test]
    fn malformed_forwarded_for_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("<script>, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));

        let meta = RequestMeta::from_headers(&headers, None);
        assert_eq!(meta.source_ip, "198.51.100.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("2001:db8::1"));
        assert_eq!(RequestMeta::from_headers(&headers, None).source_ip, "2001:db8::1");
    }

    #[test]
    fn keeps_caller_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        let meta = RequestMeta::from_headers(&headers, None);
        assert_eq!(meta.request_id, "abc-123");
        assert_eq!(meta.source_ip, "");
    }
}
