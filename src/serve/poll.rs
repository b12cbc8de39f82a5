//! The HTTP long-poll fallback transport.
//!
//! `POST /_pywire/session` creates a session and returns its id;
//! `GET /_pywire/poll` holds for up to 30 s waiting on queued messages;
//! `POST /_pywire/event` dispatches one event and returns one message.
//! Frames are JSON over this transport.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use super::session::{handle_client_message, handle_event_direct, TransportKind};
use super::{message::ClientMessage, SharedApp};
use crate::prelude::*;

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Session not found"})),
    )
        .into_response()
}

pub async fn create_session(
    State(app): State<SharedApp>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let path = body
        .as_ref()
        .and_then(|Json(body)| body.get("path"))
        .and_then(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    let session = app.sessions.create(TransportKind::HttpPoll, &path);

    // Bind the page up front so the first event has context.
    handle_client_message(&app, &session, ClientMessage::Init { path }).await;

    Json(serde_json::json!({"sessionId": session.id})).into_response()
}

pub async fn poll(
    State(app): State<SharedApp>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(session) = params.get("session").and_then(|id| app.sessions.get(id)) else {
        return session_not_found();
    };

    session.touch();
    let messages = session
        .drain_wait(Duration::from_secs(POLL_TIMEOUT_SECS))
        .await;

    Json(messages).into_response()
}

pub async fn event(
    State(app): State<SharedApp>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|id| app.sessions.get(id));

    let Some(session) = session else {
        return session_not_found();
    };

    let handler = body
        .get("handler")
        .and_then(|h| h.as_str())
        .unwrap_or_default()
        .to_string();
    let data = body
        .get("data")
        .cloned()
        .unwrap_or(serde_json::Value::Object(Default::default()));

    let reply = handle_event_direct(&app, &session, &handler, &data).await;
    Json(reply).into_response()
}
