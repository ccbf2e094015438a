use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts, HeaderMap, Method},
};

use crate::error::AppError;

pub const MAX_USER_AGENT_CHARS: usize = 512;

/// What the session chain and the audit hook know about the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    /// Path plus query string; stored as the post-login target.
    pub full_path: String,
    pub client_ip: Option<String>,
    /// Already truncated to [`MAX_USER_AGENT_CHARS`].
    pub user_agent: Option<String>,
    pub session_key: Option<String>,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts) -> Self {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let full_path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            full_path,
            client_ip: client_ip(&parts.headers, peer),
            user_agent: parts
                .headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(truncate_user_agent),
            session_key: None,
        }
    }

    pub fn with_session_key(mut self, key: Option<String>) -> Self {
        self.session_key = key;
        self
    }

    /// Whether the request can be replayed by redirecting to it after login.
    pub fn is_navigation(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}

/// First `X-Forwarded-For` entry, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

pub fn truncate_user_agent(raw: &str) -> String {
    raw.chars().take(MAX_USER_AGENT_CHARS).collect()
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(context) = parts.extensions.get::<RequestContext>() {
            return Ok(context.clone());
        }
        Ok(Self::from_parts(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        let peer = Some(SocketAddr::from(([10, 0, 0, 1], 4000)));
        assert_eq!(client_ip(&headers, peer).as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn empty_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" "));
        let peer = Some(SocketAddr::from(([10, 0, 0, 1], 4000)));
        assert_eq!(client_ip(&headers, peer).as_deref(), Some("10.0.0.1"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn user_agent_is_cut_at_512_chars() {
        let long = "é".repeat(600);
        let truncated = truncate_user_agent(&long);
        assert_eq!(truncated.chars().count(), MAX_USER_AGENT_CHARS);
    }

    #[test]
    fn context_keeps_the_query_in_full_path() {
        let request = Request::builder()
            .uri("/me/reports?month=2024-01")
            .header(USER_AGENT, "curl/8.0")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let context = RequestContext::from_parts(&parts);

        assert_eq!(context.path, "/me/reports");
        assert_eq!(context.full_path, "/me/reports?month=2024-01");
        assert_eq!(context.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(context.client_ip, None);
    }
}
