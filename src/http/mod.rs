//! HTTP surface: find-game API, health check and the play socket routes

pub mod routes;

use std::net::SocketAddr;

use axum::http::HeaderMap;

pub use routes::{build_router, AppError};

/// Client address, preferring proxy headers over the peer address
pub fn client_ip(headers: &HeaderMap, peer: Option<&SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(&peer)).as_deref(), Some("10.0.0.1"));

        headers.insert("x-real-ip", HeaderValue::from_static("1.2.3.4"));
        assert_eq!(client_ip(&headers, Some(&peer)).as_deref(), Some("1.2.3.4"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("5.6.7.8, 10.0.0.2"));
        assert_eq!(client_ip(&headers, Some(&peer)).as_deref(), Some("5.6.7.8"));
    }

    #[test]
    fn test_client_ip_unknown() {
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
