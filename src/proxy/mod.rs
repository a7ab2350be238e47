pub mod admin;
pub mod engine;

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::HeaderMap;
use uuid::Uuid;

pub use engine::ReverseProxy;

/// Per-request data visible to the selection strategies
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_id: String,
    pub method: String,
    pub path: String,
    pub start_time: Instant,
}

impl RequestContext {
    pub fn new(client_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            method: method.into(),
            path: path.into(),
            start_time: Instant::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Resolve the identity a request is rate limited under.
///
/// `X-Forwarded-For` (first entry) then `X-Real-IP` are consulted only when
/// `trust_forwarded` is set; the peer address is the fallback.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
