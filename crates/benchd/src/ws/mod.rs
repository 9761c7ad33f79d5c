// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport (§6): the state/log fan-out socket, the log
//! ingest/health HTTP endpoints, and an MJPEG reverse proxy onto the capture
//! sidecar. Modeled on the teacher's `transport` module: one `build_router`
//! assembling routes over a single shared state, `CorsLayer::permissive()`,
//! `with_state` last.

pub mod command;
pub mod handler;
pub mod logs;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::app::AppHandle;

/// Build the axum `Router` with every route the orchestrator exposes.
pub fn build_router(app: Arc<AppHandle>) -> Router {
    Router::new()
        .route("/api/health", get(logs::health))
        .route("/api/logs/ingest", post(logs::ingest))
        .route("/api/sidecar/stream", get(sidecar_stream))
        .route("/ws", get(handler::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// `GET /api/sidecar/stream` — reverse-proxies the MJPEG stream served by the
/// FFmpeg capture sidecar at `SIDECAR_HOST:SIDECAR_PORT`, forwarding its
/// `content-type` (the `multipart/x-mixed-replace; boundary=...` MJPEG
/// header) verbatim so browsers render it directly.
async fn sidecar_stream(State(app): State<Arc<AppHandle>>) -> impl IntoResponse {
    let url = format!("http://{}:{}/stream", app.config.sidecar_host, app.config.sidecar_port);
    let upstream = match app.http.get(&url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(%err, "sidecar stream unreachable");
            return (StatusCode::BAD_GATEWAY, format!("sidecar unreachable: {err}")).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let body = axum::body::Body::from_stream(upstream.bytes_stream());

    let mut builder = axum::http::Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    match builder.body(body) {
        Ok(response) => response.into_response(),
        Err(_) => (StatusCode::BAD_GATEWAY, "proxy error").into_response(),
    }
}
