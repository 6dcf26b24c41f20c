// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket command channel.
//!
//! Each connection carries JSON command envelopes inbound and two outbound
//! streams merged onto one socket: correlation replies for the commands this
//! client sent, and the core's broadcast events (telemetry, scene lifecycle,
//! state changes, alerts). Slow clients drop broadcast events, never replies.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use waldo_core::command::{reply_err, reply_ok, CommandEnvelope};
use waldo_core::error::CommandError;
use waldo_core::system::System;

/// `GET /ws` — WebSocket upgrade for a control client.
pub async fn ws_handler(
    State(system): State<Arc<System>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, system))
}

/// Per-connection handler.
async fn handle_ws(socket: WebSocket, system: Arc<System>) {
    let mut events = system.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Core broadcast -> client. Lagged receivers skip to the tail.
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "ws client lagged; dropping events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            // Client -> command dispatch, reply on the same socket.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = dispatch(&system, &text).await;
                        let Ok(text) = serde_json::to_string(&reply) else { continue };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // ping/pong/binary ignored
                }
            }
        }
    }
}

/// Decode one envelope and run it, mapping both decode and execution
/// failures into the structured error reply.
async fn dispatch(system: &System, text: &str) -> serde_json::Value {
    let envelope: CommandEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let err = CommandError::BadRequest(e.to_string());
            return reply_err(None, &err);
        }
    };

    match system.handle_command(envelope.command).await {
        Ok(data) => reply_ok(envelope.id.as_ref(), data),
        Err(e) => reply_err(envelope.id.as_ref(), &e),
    }
}
