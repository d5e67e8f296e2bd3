//! JSON response encoding with validators, cache directives and gzip.

use axum::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use tracing::{error, warn};

use crate::compression::{accepts_gzip, CompressionPool};
use crate::config::EncoderConfig;
use crate::error::{ApiError, ErrorResponse};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Used if even the error body cannot be serialized.
const FALLBACK_ERROR_BODY: &[u8] =
    br#"{"error":"internal_error","message":"Failed to encode response","code":500}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

/// The parts of a request that shape its response representation.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub method: Method,
    pub accept_encoding: Option<String>,
    pub if_none_match: Option<String>,
    /// Seconds a shared cache may keep the response; `None` or 0 means no-store.
    pub cache_ttl: Option<u64>,
}

impl EncodeRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            accept_encoding: None,
            if_none_match: None,
            cache_ttl: None,
        }
    }

    pub fn from_headers(method: Method, headers: &HeaderMap) -> Self {
        let header_str = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            method,
            accept_encoding: header_str(header::ACCEPT_ENCODING),
            if_none_match: header_str(header::IF_NONE_MATCH),
            cache_ttl: None,
        }
    }

    pub fn with_accept_encoding(mut self, value: impl Into<String>) -> Self {
        self.accept_encoding = Some(value.into());
        self
    }

    pub fn with_if_none_match(mut self, value: impl Into<String>) -> Self {
        self.if_none_match = Some(value.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Option<u64>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for EncodeRequest
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(parts.method.clone(), &parts.headers))
    }
}

/// Wire-ready response for a single request.
#[derive(Debug, Clone)]
pub struct EncodedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_encoding: ContentEncoding,
    pub etag: Option<String>,
    /// HEAD and 304 responses carry headers only.
    pub suppress_body: bool,
}

impl IntoResponse for EncodedResponse {
    fn into_response(self) -> Response {
        let body = if self.suppress_body {
            Body::empty()
        } else {
            Body::from(self.body)
        };

        let mut resp = Response::new(body);
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers;
        resp
    }
}

pub struct ResponseEncoder {
    pool: CompressionPool,
    min_compress_size: usize,
}

impl ResponseEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            pool: CompressionPool::new(config.pool_size),
            min_compress_size: config.min_compress_size,
        }
    }

    pub fn pool(&self) -> &CompressionPool {
        &self.pool
    }

    /// Encode a 200 response for `payload`.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T, req: &EncodeRequest) -> EncodedResponse {
        self.encode_with_status(StatusCode::OK, payload, req)
    }

    pub fn encode_with_status<T: Serialize + ?Sized>(
        &self,
        status: StatusCode,
        payload: &T,
        req: &EncodeRequest,
    ) -> EncodedResponse {
        match serde_json::to_vec(payload) {
            Ok(body) => self.encode_bytes(status, body, req),
            Err(err) => {
                error!(error = %err, "Failed to serialize response payload");
                self.internal_error(req)
            }
        }
    }

    fn internal_error(&self, req: &EncodeRequest) -> EncodedResponse {
        let err = ApiError::InternalServerError("Failed to encode response".to_string());
        let body = ErrorResponse::from_api_error(&err);
        let bytes =
            serde_json::to_vec(&body).unwrap_or_else(|_| FALLBACK_ERROR_BODY.to_vec());

        // Errors are never cached or revalidated.
        let req = EncodeRequest {
            method: req.method.clone(),
            accept_encoding: req.accept_encoding.clone(),
            if_none_match: None,
            cache_ttl: None,
        };
        self.encode_bytes(err.status_code(), bytes, &req)
    }

    fn encode_bytes(&self, status: StatusCode, body: Vec<u8>, req: &EncodeRequest) -> EncodedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        headers.insert(header::CACHE_CONTROL, cache_control(req.cache_ttl));

        let mut etag = None;
        if req.is_read() && status == StatusCode::OK {
            let tag = weak_etag(&body);
            if let Ok(value) = HeaderValue::from_str(&tag) {
                headers.insert(header::ETAG, value);
            }

            if req
                .if_none_match
                .as_deref()
                .is_some_and(|validators| etag_matches(validators, &tag))
            {
                return EncodedResponse {
                    status: StatusCode::NOT_MODIFIED,
                    headers,
                    body: Bytes::new(),
                    content_encoding: ContentEncoding::Identity,
                    etag: Some(tag),
                    suppress_body: true,
                };
            }
            etag = Some(tag);
        }

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));

        let (body, content_encoding) = self.maybe_compress(body, req);
        if content_encoding == ContentEncoding::Gzip {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        EncodedResponse {
            status,
            headers,
            body,
            content_encoding,
            etag,
            suppress_body: req.method == Method::HEAD,
        }
    }

    fn maybe_compress(&self, body: Vec<u8>, req: &EncodeRequest) -> (Bytes, ContentEncoding) {
        let wants_gzip = req.accept_encoding.as_deref().is_some_and(accepts_gzip);
        if !wants_gzip || body.len() < self.min_compress_size {
            return (Bytes::from(body), ContentEncoding::Identity);
        }

        let mut scratch = self.pool.acquire();
        match scratch.gzip(&body) {
            Ok(compressed) if compressed.len() < body.len() => {
                (Bytes::copy_from_slice(compressed), ContentEncoding::Gzip)
            }
            Ok(_) => (Bytes::from(body), ContentEncoding::Identity),
            Err(err) => {
                warn!(error = %err, size = body.len(), "Compression failed, sending identity body");
                (Bytes::from(body), ContentEncoding::Identity)
            }
        }
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self::new(EncoderConfig::default())
    }
}

fn cache_control(ttl: Option<u64>) -> HeaderValue {
    match ttl {
        Some(secs) if secs > 0 => HeaderValue::from_str(&format!("public, max-age={}", secs))
            .unwrap_or_else(|_| HeaderValue::from_static("no-store")),
        _ => HeaderValue::from_static("no-store"),
    }
}

/// `W/"<sha256 hex>"` of the serialized body.
pub fn weak_etag(body: &[u8]) -> String {
    format!("W/\"{}\"", hex::encode(Sha256::digest(body)))
}

/// Weak comparison of an `If-None-Match` value against `etag`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let opaque = |tag: &str| {
        let tag = tag.trim();
        tag.strip_prefix("W/").unwrap_or(tag).to_string()
    };
    let target = opaque(etag);

    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque(candidate) == target)
}
