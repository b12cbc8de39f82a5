//! The full-duplex transport: one WebSocket per connected browser, CBOR
//! frames both ways.
//!
//! The receive loop processes frames strictly in arrival order; a separate
//! sender task drains the session's outbound queue, so server-initiated
//! broadcasts (hot reload, console) interleave correctly with replies.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use super::message::{decode_cbor, encode_cbor};
use super::session::{handle_client_message, TransportKind};
use super::SharedApp;
use crate::prelude::*;

pub async fn upgrade(State(app): State<SharedApp>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(app, socket))
}

async fn handle_socket(app: SharedApp, socket: WebSocket) {
    let session = app.sessions.create(TransportKind::Websocket, "/");
    debug!("websocket session {} connected", session.id);

    let (mut sender, mut receiver) = socket.split();

    let outbound_session = session.clone();
    let sender_task = tokio::spawn(async move {
        loop {
            let messages = outbound_session.drain_wait(Duration::from_secs(60)).await;
            for message in messages {
                let bytes = match encode_cbor(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("could not encode outbound frame: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Binary(bytes)).await.is_err() {
                    return;
                }
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };

        match frame {
            Message::Binary(bytes) => match decode_cbor(&bytes) {
                Ok(client_message) => {
                    handle_client_message(&app, &session, client_message).await;
                }
                Err(e) => warn!("undecodable frame from session {}: {e}", session.id),
            },
            Message::Text(text) => {
                // JSON fallback for clients that negotiated down.
                match serde_json::from_str(&text) {
                    Ok(client_message) => {
                        handle_client_message(&app, &session, client_message).await;
                    }
                    Err(e) => warn!("undecodable text frame from session {}: {e}", session.id),
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Client gone: cancel the session's tasks and drop its state.
    sender_task.abort();
    app.sessions.remove(&session.id);
    debug!("websocket session {} closed", session.id);
}
