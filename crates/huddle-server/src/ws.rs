//! WebSocket endpoint for the realtime protocol.
//!
//! The caller is authenticated before the upgrade. Each socket is then split
//! into a send task that drains the connection's hub queue and a receive task
//! that feeds text frames to the dispatcher. Whichever side finishes first
//! aborts the other, and dropping the connection guard unregisters it.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use huddle_shared::types::UserId;
use huddle_shared::ChatError;

use crate::api::AppState;
use crate::auth::realtime_token;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = realtime_token(&headers, params.token.as_deref())
        .ok_or_else(|| ChatError::Unauthenticated("Authentication required".into()))?;
    let user = state.authenticate(token)?;

    Ok(ws.on_upgrade(move |socket| run_connection(state, user, socket)))
}

async fn run_connection(state: AppState, user: UserId, socket: WebSocket) {
    let dispatcher = state.dispatcher.clone();
    let connected = tokio::task::spawn_blocking(move || dispatcher.connect(user)).await;
    let (guard, mut events) = match connected {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(user = %user, error = %e, "Could not open realtime connection");
            return;
        }
        Err(e) => {
            warn!(user = %user, error = %e, "Realtime connect task failed");
            return;
        }
    };
    let guard = Arc::new(guard);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to encode server event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let dispatcher = state.dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    // Frames run one at a time, off the runtime workers.
                    let (dispatcher, conn) = (dispatcher.clone(), guard.clone());
                    let handled =
                        tokio::task::spawn_blocking(move || dispatcher.handle_frame(&conn, &text)).await;
                    if let Err(e) = handled {
                        warn!(conn = %guard.id(), error = %e, "Realtime command task failed");
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        debug!(conn = %guard.id(), "Realtime connection closing");
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
