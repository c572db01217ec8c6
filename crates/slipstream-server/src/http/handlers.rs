//! HTTP request handlers for the proxy and control-plane endpoints.

use crate::server::AppState;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use slipstream_fetch::{ControlMessage, FetchError, ProxyRequest, control};
use std::sync::Arc;
use std::time::Instant;

/// Client request headers that are not forwarded upstream
const SKIPPED_REQUEST_HEADERS: &[&str] = &["accept-encoding", "sec-fetch-mode"];

/// Query string of `/proxy`.
#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    /// Target URL, absolute or relative to the upstream origin
    pub url: String,
}

/// Handle `/proxy?url=<target>` for any method.
///
/// A `Sec-Fetch-Mode: navigate` header marks the request as a page navigation,
/// which gets a diagnostic page instead of an error once every fallback fails.
///
/// # Errors
///
/// Returns `AppError` if the target cannot be resolved or the request failed
/// outright.
pub async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let target = state
        .resolve(&query.url)
        .ok_or_else(|| AppError::BadRequest(format!("Cannot proxy '{}'", query.url)))?;

    let mut request = ProxyRequest::new(method.as_str(), target.as_str());
    request.navigate = headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|mode| mode.eq_ignore_ascii_case("navigate"));
    for (name, value) in &headers {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request.headers.append(name.as_str(), value);
        }
    }
    request.body = body;

    tracing::debug!("Proxying {} {}", request.method, request.url);

    let result = state.orchestrator().respond(&request).await;
    let seconds = started.elapsed().as_secs_f64();
    match result {
        Ok(response) => {
            let outcome = if response.is_stale() { "stale" } else { "ok" };
            state.metrics().record_proxy(outcome, seconds);
            Ok(into_http(response))
        }
        Err(e) => {
            state.metrics().record_proxy("error", seconds);
            Err(AppError::Upstream(e))
        }
    }
}

/// Handle `POST /control`.
///
/// PING and STATUS_REQUEST are answered with JSON. ERROR_REPORT and
/// FORCE_CACHE_MAINTENANCE are accepted without a body.
pub async fn handle_control(
    State(state): State<Arc<AppState>>,
    Json(message): Json<ControlMessage>,
) -> Response {
    tracing::debug!("Handling control message {}", message.kind());
    state.metrics().record_control(message.kind());

    match control::handle(state.orchestrator(), message).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Handle `GET /health`.
pub async fn handle_health() -> &'static str {
    "ok"
}

/// Handle `GET /metrics`.
pub async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.orchestrator().registry();
    state
        .metrics()
        .observe_stats(&registry.stats(), registry.active_count());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().gather(),
    )
        .into_response()
}

fn into_http(response: slipstream_cache::Response) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = (status, Body::from(response.body)).into_response();

    let headers = out.headers_mut();
    for (name, value) in response.headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    out
}

/// Application-level error type for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Malformed proxy request (400)
    BadRequest(String),
    /// Every attempt, including the final direct one, failed (502)
    Upstream(FetchError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Upstream(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        };

        (status, message).into_response()
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        Self::Upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipstream_cache::Headers;

    #[test]
    fn test_into_http_copies_status_and_headers() {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/wasm");
        headers.insert("content-length", "999");
        headers.insert("x-cache-stale", "true");
        let response = into_http(slipstream_cache::Response::new(203, headers, vec![1u8, 2, 3]));

        assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(response.headers()["content-type"], "application/wasm");
        assert_eq!(response.headers()["x-cache-stale"], "true");
        assert_ne!(
            response.headers().get("content-length").map(HeaderValue::as_bytes),
            Some(b"999".as_slice())
        );
    }

    #[test]
    fn test_into_http_emits_one_line_per_cookie() {
        let mut headers = Headers::new();
        headers.append("set-cookie", "session=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT");
        headers.append("set-cookie", "theme=dark");
        let response = into_http(slipstream_cache::Response::new(200, headers, "ok"));

        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            cookies,
            vec![
                "session=abc; Expires=Wed, 21 Oct 2026 07:28:00 GMT".to_string(),
                "theme=dark".to_string(),
            ]
        );
    }

    #[test]
    fn test_app_error_status() {
        let response = AppError::BadRequest("nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::from(FetchError::Cancelled).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_handle_health() {
        assert_eq!(handle_health().await, "ok");
    }
}
