use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::handlers::SharedState;

/// Requests that bypass admission control.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    pub skip_paths: HashSet<String>,
    pub whitelist: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn new<P, W>(skip_paths: P, whitelist: W) -> Self
    where
        P: IntoIterator<Item = String>,
        W: IntoIterator<Item = String>,
    {
        Self {
            skip_paths: skip_paths.into_iter().collect(),
            whitelist: whitelist.into_iter().collect(),
        }
    }

    pub fn is_exempt(&self, path: &str, client: &str) -> bool {
        self.skip_paths.contains(path) || self.whitelist.contains(client)
    }
}

/// Identity the admission middleware resolved for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Per-client token bucket admission.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = get_client_ip(&request);
    request.extensions_mut().insert(ClientId(client.clone()));

    if state.policy.is_exempt(request.uri().path(), &client) {
        return next.run(request).await;
    }

    let limit = state.registry.config().burst;
    let admission = state.registry.check(&client);

    if !admission.allowed {
        warn!(
            target: "gatekeeper::middleware",
            client = %client,
            uri = %request.uri(),
            "Rate limit exceeded"
        );
        return ApiError::RateLimitExceeded {
            limit,
            retry_after: admission.retry_after,
        }
        .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(admission.remaining));
    response
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);

    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

/// Forwarded headers win over the transport peer address.
pub fn get_client_ip(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            let ip_str = ip_str.trim();
            if !ip_str.is_empty() {
                return ip_str.to_string();
            }
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_get_client_ip_with_forwarded_header() {
        let mut request = Request::new(Body::empty());
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(get_client_ip(&request), "192.168.1.1");
    }

    #[test]
    fn test_get_client_ip_with_real_ip_header() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(get_client_ip(&request), "203.0.113.1");
    }

    #[test]
    fn test_get_client_ip_from_peer_address() {
        let mut request = Request::new(Body::empty());
        let addr: SocketAddr = "198.51.100.7:52000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        assert_eq!(get_client_ip(&request), "198.51.100.7");
    }

    #[test]
    fn test_get_client_ip_fallback() {
        let request = Request::new(Body::empty());
        assert_eq!(get_client_ip(&request), "unknown");
    }

    #[test]
    fn test_admission_policy() {
        let policy = AdmissionPolicy::new(
            vec!["/healthz".to_string()],
            vec!["10.0.0.1".to_string()],
        );
        assert!(policy.is_exempt("/healthz", "1.2.3.4"));
        assert!(policy.is_exempt("/api/v1/hello", "10.0.0.1"));
        assert!(!policy.is_exempt("/api/v1/hello", "1.2.3.4"));
    }
}
