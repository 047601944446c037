// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack applied, outermost first, in the order: request id,
//! rate limiting, CORS, response timing, security headers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    resp.headers_mut()
        .insert("x-request-id", HeaderValue::from_str(&id.0.to_string()).unwrap());
    resp
}

pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

/// `X-Processing-Time`, in milliseconds, measured around the rest of the
/// middleware chain and the handler.
pub async fn response_timing(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut resp = next.run(req).await;
    let millis = start.elapsed().as_millis();
    if let Ok(value) = HeaderValue::from_str(&millis.to_string()) {
        resp.headers_mut().insert("x-processing-time", value);
    }
    resp
}

pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert("x-api-version", HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
    resp
}

/// Maps the request path to the endpoint label `sgd_ratelimit::EndpointLimits`
/// carries an override for, defaulting to the path itself for anything else.
fn endpoint_label(path: &str) -> &'static str {
    if path == "/render" {
        "render"
    } else if path == "/render/async" {
        "async-render"
    } else if path.starts_with("/ingest") {
        "ingest"
    } else if path == "/upload" {
        "upload"
    } else if path == "/critique" {
        "critique"
    } else if path == "/canon/derive" {
        "canon-derive"
    } else {
        "other"
    }
}

fn client_identifier(req: &Request) -> String {
    let api_key_prefix = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|k| k.chars().take(12).collect::<String>());
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    sgd_ratelimit::resolve_identifier(api_key_prefix.as_deref(), None, client_ip.as_deref())
}

/// Rate limiting middleware backed by `sgd_ratelimit::RateLimiter`, a plain
/// function rather than a `Layer`/`Service` pair (unlike the daemon's
/// `RateLimiter`, ours carries no per-call state that needs `Clone` through
/// `tower::Service`) — short-circuits with 429 before the handler runs,
/// always carrying `X-RateLimit-*` headers.
pub async fn rate_limit(state: axum::extract::State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let endpoint = endpoint_label(req.uri().path());
    let identifier = client_identifier(&req);
    let check = state.rate_limiter.check(&identifier, endpoint);

    if !check.allowed {
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
        set_rate_limit_headers(&mut resp, &check);
        return resp;
    }

    let mut resp = next.run(req).await;
    set_rate_limit_headers(&mut resp, &check);
    resp
}

fn set_rate_limit_headers(resp: &mut Response, check: &sgd_ratelimit::CheckResult) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&check.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&check.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&check.reset_after_secs.to_string()) {
        headers.insert("x-ratelimit-reset", v.clone());
        if !check.allowed {
            headers.insert("retry-after", v);
        }
    }
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    let methods: Vec<axum::http::Method> = ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();

    let headers: Vec<axum::http::HeaderName> = ["content-type", "authorization", "x-api-key", "idempotency-key"]
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::list(methods))
            .allow_headers(AllowHeaders::list(headers))
    }
}
