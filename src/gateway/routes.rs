//! Gateway routes and middleware
//!
//! HTTP handlers for protected image URLs, viewer identity resolution from
//! upstream headers, and the security headers every response carries.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::{DenyReason, GatewayError};
use super::service::{ProtectionGateway, ServeOutcome, ServedImage, ServedVariant};
use crate::core::types::{Viewer, ViewerId};
use crate::token::ProtectedUrl;

/// Header set on blurred responses so clients can prompt for login
pub const LOGIN_REQUIRED_HEADER: &str = "x-login-required";

/// Reads the viewer identity the front controller attached to the request
#[derive(Debug, Clone)]
pub struct ViewerResolver {
    header: HeaderName,
}

impl ViewerResolver {
    pub fn new(header: &str) -> Result<Self, GatewayError> {
        let header = HeaderName::from_bytes(header.trim().to_ascii_lowercase().as_bytes()).map_err(|_| {
            GatewayError::Internal {
                reason: format!("invalid viewer header name '{}'", header),
            }
        })?;
        Ok(Self { header })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    /// A positive numeric id in the viewer header marks the request authenticated
    pub fn resolve(&self, headers: &HeaderMap) -> Viewer {
        let id = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(ViewerId)
            .filter(|id| id.is_valid());

        let viewer = match id {
            Some(id) => Viewer::authenticated(id),
            None => Viewer::anonymous(),
        };
        match client_ip(headers) {
            Some(ip) => viewer.with_ip(ip),
            None => viewer,
        }
    }
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Shared state for the gateway routes
#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<ProtectionGateway>,
    pub viewers: ViewerResolver,
}

/// Adds security response headers to every response
pub async fn security_middleware(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    // Prevent MIME type sniffing
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));

    // Prevent clickjacking
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));

    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'"),
    );

    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }

    response
}

/// Serve a protected image
///
/// Route: GET /protected?protected_image=&item=&size=&token=
pub async fn serve_protected(
    State(state): State<GatewayState>,
    query: Option<Query<ProtectedUrl>>,
    headers: HeaderMap,
) -> Response {
    let Some(Query(request)) = query else {
        return deny_response(DenyReason::TokenInvalid);
    };

    let viewer = state.viewers.resolve(&headers);
    match state.gateway.serve(&request, &viewer).await {
        ServeOutcome::Served(image) => image_response(image, state.viewers.header()),
        ServeOutcome::Denied(reason) => deny_response(reason),
    }
}

/// Liveness check
pub async fn health() -> &'static str {
    "OK"
}

fn image_response(image: ServedImage, viewer_header: &HeaderName) -> Response {
    let content_type = HeaderValue::from_str(&image.mime)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let cache_control = image.cache_control();
    let varies_by_viewer = image.varies_by_viewer();
    let bytes = Arc::try_unwrap(image.bytes).unwrap_or_else(|shared| shared.as_ref().clone());

    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    if varies_by_viewer {
        if let Ok(vary) = HeaderValue::from_str(viewer_header.as_str()) {
            headers.insert(header::VARY, vary);
        }
    }
    if matches!(image.variant, ServedVariant::Blurred | ServedVariant::Fallback) {
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(LOGIN_REQUIRED_HEADER, HeaderValue::from_static("true"));
    }
    response
}

fn deny_response(reason: DenyReason) -> Response {
    if reason.is_forbidden() {
        return reason.status_code().into_response();
    }
    let headers = [(header::CONTENT_TYPE, "text/plain")];
    (reason.status_code(), headers, reason.message()).into_response()
}
