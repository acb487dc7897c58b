use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::realtime::RouteSubscription;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RouteSocketQuery {
    pub token: Option<String>,
}

/// Why a socket is refused after the upgrade.
enum Refusal {
    Policy(String),
    Internal,
}

pub async fn route_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(courier_id): Path<Uuid>,
    Query(query): Query<RouteSocketQuery>,
) -> impl IntoResponse {
    let verdict = authorize(&state, courier_id, query.token.as_deref()).await;

    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(()) => handle_socket(socket, state, courier_id).await,
            Err(Refusal::Policy(reason)) => {
                warn!(courier_id = %courier_id, reason = %reason, "route socket refused");
                close(socket, close_code::POLICY, reason).await;
            }
            Err(Refusal::Internal) => {
                close(socket, close_code::ERROR, "internal error".to_string()).await;
            }
        }
    })
}

async fn authorize(state: &AppState, courier_id: Uuid, token: Option<&str>) -> Result<(), Refusal> {
    let token = token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Refusal::Policy("missing token".to_string()))?;
    let claims = state
        .jwt
        .verify(token)
        .map_err(|err| Refusal::Policy(err.to_string()))?;

    if claims.role != Role::Courier || claims.sub != courier_id {
        return Err(Refusal::Policy("token subject does not match courier".to_string()));
    }

    match state.store.courier(courier_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Refusal::Policy("unknown courier".to_string())),
        Err(err) => {
            warn!(courier_id = %courier_id, error = %err, "courier lookup failed");
            Err(Refusal::Internal)
        }
    }
}

async fn close(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason),
    };
    if socket.send(Message::Close(Some(frame))).await.is_err() {
        warn!("failed to send close frame");
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, courier_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let RouteSubscription {
        id: subscription_id,
        mut frames,
        ..
    } = state.routes.subscribe(courier_id);
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(4);

    info!(courier_id = %courier_id, "route socket connected");
    state.routes.push_for_courier(courier_id).await;

    let mut send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                frame = frames.recv() => frame,
                reply = reply_rx.recv() => reply,
            };
            let Some(text) = outgoing else {
                break;
            };

            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) if text.trim() == "ping" => {
                    if reply_tx.send("pong".to_string()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.routes.unsubscribe(courier_id, subscription_id);
    info!(courier_id = %courier_id, "route socket disconnected");
}
