// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP surface: one SSE stream per chat request plus stop and health.
//!
//! | Route | Method | Response |
//! |-------|--------|----------|
//! | `/api/chat` | POST | `text/event-stream`, one JSON frame per `data:` line, `x-request-id` header |
//! | `/api/chat/{request_id}/stop` | POST | `{"stopped": bool}` |
//! | `/health` | GET | pool snapshot and backend status |

use axum::{
    extract::{Path, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::application::lifecycle::ChatService;
use crate::domain::admission::RequestId;
use crate::domain::chat::ChatRequest;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct AppState {
    pub chat: Arc<ChatService>,
    pub start_time: Instant,
}

pub fn app(chat: Arc<ChatService>) -> Router {
    let state = Arc::new(AppState {
        chat,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/{request_id}/stop", post(stop_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let started = state.chat.start(request);
    let request_id = started.request_id;
    debug!(request_id = %request_id, "Opening event stream");

    let frames = started
        .events
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_frame().to_string())));

    let mut response = Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id: RequestId = match request_id.parse() {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid request ID"),
    };

    if state.chat.stop(request_id) {
        Json(json!({ "stopped": true, "request_id": request_id.to_string() })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "stopped": false,
                "request_id": request_id.to_string(),
                "error": "No live request with that ID",
            })),
        )
            .into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let slots = state.chat.snapshot();
    let inference = match state.chat.backend_health().await {
        Ok(()) => json!({ "status": "ok" }),
        Err(e) => json!({ "status": "unreachable", "error": e.to_string() }),
    };
    let status = if state.chat.slots().is_closed() {
        "shutting_down"
    } else if inference["status"] == "ok" {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "model": state.chat.model(),
        "live_requests": state.chat.live_requests(),
        "slots": slots,
        "inference": inference,
    }))
}
