//! WebSocket surfaces: `/ws/hitl` and `/ws/audit`. Both deliver a snapshot
//! frame on open, then stream incremental `{type, data}` frames from the
//! notification bus. The HITL socket additionally accepts `hitl_decision`
//! and `request_pending` frames from the client.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use hostbridge_topics as topics;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub async fn ws_hitl(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| hitl_socket(state, socket))
}

pub async fn ws_audit(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| audit_socket(state, socket))
}

async fn send_json(socket: &mut WebSocket, frame: &Value) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

async fn send_pending_snapshot(state: &AppState, socket: &mut WebSocket) -> bool {
    let pending = state.hitl.list_pending();
    send_json(
        socket,
        &json!({"type": "pending_requests", "data": pending}),
    )
    .await
}

async fn hitl_socket(state: AppState, mut socket: WebSocket) {
    // Subscribe before the snapshot so nothing between snapshot and stream
    // is lost; duplicates are fine, gaps are not.
    let mut rx = state
        .bus
        .subscribe_filtered(vec![topics::PREFIX_HITL.to_string()], None);
    if !send_pending_snapshot(&state, &mut socket).await {
        return;
    }
    debug!("hitl websocket connected");
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(env) => {
                    let frame_type = if env.kind == topics::TOPIC_HITL_CREATED {
                        "hitl_request"
                    } else {
                        "hitl_update"
                    };
                    if !send_json(&mut socket, &json!({"type": frame_type, "data": env.payload})).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    state.bus.note_lag(n);
                    // Re-snapshot so the client is consistent again.
                    if !send_pending_snapshot(&state, &mut socket).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !handle_client_frame(&state, &mut socket, &text).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "hitl websocket error");
                    break;
                }
            },
        }
    }
    debug!("hitl websocket disconnected");
}

async fn handle_client_frame(state: &AppState, socket: &mut WebSocket, text: &str) -> bool {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return send_json(
                socket,
                &json!({"type": "error", "data": {"message": "invalid JSON frame"}}),
            )
            .await
        }
    };
    match frame["type"].as_str() {
        Some("request_pending") => send_pending_snapshot(state, socket).await,
        Some("hitl_decision") => {
            let data = &frame["data"];
            let Some(id) = data["id"].as_str() else {
                return send_json(
                    socket,
                    &json!({"type": "error", "data": {"message": "missing id"}}),
                )
                .await;
            };
            let approve = match data["decision"].as_str() {
                Some("approve") => true,
                Some("reject") => false,
                _ => {
                    return send_json(
                        socket,
                        &json!({"type": "error", "data": {"message": "decision must be 'approve' or 'reject'"}}),
                    )
                    .await
                }
            };
            let reviewer = data["reviewer"].as_str().unwrap_or("admin");
            let note = data["note"].as_str().map(str::to_string);
            match state.hitl.decide(id, approve, reviewer, note) {
                Ok(view) => {
                    send_json(socket, &json!({"type": "decision_ack", "data": view})).await
                }
                Err(err) => {
                    send_json(
                        socket,
                        &json!({"type": "error", "data": {"message": err.message}}),
                    )
                    .await
                }
            }
        }
        _ => {
            send_json(
                socket,
                &json!({"type": "error", "data": {"message": "unknown frame type"}}),
            )
            .await
        }
    }
}

async fn audit_socket(state: AppState, mut socket: WebSocket) {
    let mut rx = state
        .bus
        .subscribe_filtered(vec![topics::PREFIX_AUDIT.to_string()], None);
    let snapshot = state
        .kernel
        .recent_audit_async(50)
        .await
        .unwrap_or_default();
    if !send_json(&mut socket, &json!({"type": "audit_snapshot", "data": snapshot})).await {
        return;
    }
    debug!("audit websocket connected");
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(env) => {
                    if env.kind != topics::TOPIC_AUDIT_APPENDED {
                        continue;
                    }
                    if !send_json(&mut socket, &json!({"type": "audit_entry", "data": env.payload})).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    state.bus.note_lag(n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "audit websocket error");
                    break;
                }
            },
        }
    }
    debug!("audit websocket disconnected");
}
