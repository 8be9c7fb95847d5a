//! Front-end middleware.
//!
//! Stack order (outermost first): security headers, origin allowlist,
//! global rate limit, body size cap, request-id injection, access log.
//! Bearer and project header handling live in the handlers because the
//! health endpoints skip them.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::state::SharedState;

/// Conservative security headers on every response.
pub async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("no-store, no-cache"),
    );
    response
}

/// Exact-origin allowlist. Requests with no `Origin` header (same-origin,
/// curl, desktop clients) pass; cross-origin requests must match exactly.
pub async fn enforce_origin(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(origin) = request.headers().get("origin") {
        let allowed = origin
            .to_str()
            .is_ok_and(|o| state.config.http.allowed_origins.iter().any(|a| a == o));
        if !allowed {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    next.run(request).await
}

/// Global rate limit keyed by bearer token when present, source address
/// otherwise. Runs before any body is read.
pub async fn global_rate_limit(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = bearer_of(&request).map_or_else(
        || {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map_or_else(|| "anon".to_string(), |info| info.0.ip().to_string())
        },
        |bearer| format!("bearer:{bearer}"),
    );

    let decision = state.global_limiter.consume(&format!("http:{key}"), 1.0);
    if decision.allowed {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(
                "Retry-After",
                (decision.retry_after_ms.div_ceil(1000)).to_string(),
            )],
            "rate limit exceeded",
        )
            .into_response()
    }
}

/// Tag every request with an id, echoed in the response.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// The id assigned by [`request_id`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Structured access log. Never logs the bearer or the body.
pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let started = Instant::now();
    let response = next.run(request).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        request_id = %request_id,
        "request"
    );
    response
}

/// Pull the bearer token out of the Authorization header.
pub fn bearer_of(request: &Request<Body>) -> Option<String> {
    bearer_from_value(request.headers().get("authorization")?.to_str().ok()?)
}

/// Parse `Bearer <token>`; scheme is case-insensitive.
#[must_use]
pub fn bearer_from_value(value: &str) -> Option<String> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_parsing() {
        assert_eq!(bearer_from_value("Bearer abc"), Some("abc".to_string()));
        assert_eq!(bearer_from_value("bearer abc"), Some("abc".to_string()));
        assert_eq!(bearer_from_value("Basic abc"), None);
        assert_eq!(bearer_from_value("Bearer "), None);
        assert_eq!(bearer_from_value("Bearer"), None);
    }
}
