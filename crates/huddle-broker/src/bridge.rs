// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Reverse proxy for the decision-tracking daemon.
//!
//! Any request under `/bridge/` is forwarded to the configured local
//! endpoint with its method, headers, and body preserved (`Host` is
//! rewritten by the HTTP client).  The broker adds nothing and interprets
//! nothing: the bridge's API surface is entirely the daemon's own.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::http::AppState;

/// Request bodies above this size are refused rather than buffered.
const MAX_PROXY_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Handler for `* /bridge/*`.
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let Some(bridge) = &state.bridge else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "bridge proxy is not configured"})),
        )
            .into_response();
    };

    let method = req.method().clone();
    let remaining = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .strip_prefix("/bridge")
        .unwrap_or("/")
        .to_string();
    let remaining = if remaining.is_empty() {
        "/".to_string()
    } else {
        remaining
    };
    let url = format!("{}{remaining}", bridge.base_url());

    let headers = req.headers().clone();
    let body = match to_bytes(req.into_body(), MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("failed to read request body: {e}")})),
            )
                .into_response();
        }
    };

    debug!(%method, %url, "proxying to bridge");

    let mut upstream = state.client.request(method, &url);
    for (name, value) in filtered_headers(&headers) {
        upstream = upstream.header(name, value);
    }
    let result = upstream.body(body.to_vec()).send().await;

    match result {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in resp.headers() {
                // Hop-by-hop headers do not survive proxying.
                if name == "transfer-encoding" || name == "connection" {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            let bytes = resp.bytes().await.unwrap_or_default();
            builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => {
            warn!(%url, "bridge upstream error: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("bridge upstream error: {e}")})),
            )
                .into_response()
        }
    }
}

/// Headers forwarded upstream.  `Host` is dropped (the client sets the
/// upstream's own) along with hop-by-hop headers.
fn filtered_headers(headers: &HeaderMap) -> impl Iterator<Item = (&str, &[u8])> {
    headers.iter().filter_map(|(name, value)| {
        let n = name.as_str();
        if matches!(
            n,
            "host" | "connection" | "transfer-encoding" | "upgrade" | "keep-alive"
        ) {
            None
        } else {
            Some((n, value.as_bytes()))
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    #[test]
    fn host_and_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("host"), HeaderValue::from_static("x"));
        headers.insert(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive"),
        );
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("abc"),
        );
        let kept: Vec<&str> = filtered_headers(&headers).map(|(n, _)| n).collect();
        assert_eq!(kept, vec!["x-request-id"]);
    }
}
