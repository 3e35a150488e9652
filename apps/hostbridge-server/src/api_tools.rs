//! The REST adapter: every tool is served by one dynamic route,
//! `POST /api/tools/:category/:name`, translated into a canonical
//! invocation and handed to the dispatch engine.

use crate::dispatch::DispatchOptions;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostbridge_protocol::{Invocation, Protocol};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub async fn tool_invoke(
    State(state): State<AppState>,
    Path((category, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> Response {
    let mut inv = Invocation::new(category, name, params, Protocol::Rest);
    inv.caller.user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    inv.caller.client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // The dispatch runs in its own task so a client disconnect cannot skip
    // the audit write; the drop guard cancels the invocation's token, which
    // unparks any HITL wait and lets the task finish classifying.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let dispatcher = state.dispatcher.clone();
    let handle = tokio::spawn(async move {
        dispatcher
            .dispatch(
                inv,
                DispatchOptions {
                    cancel,
                    ..Default::default()
                },
            )
            .await
    });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            return crate::error::ToolError::internal(format!("dispatch task failed: {e}"))
                .into_response()
        }
    };
    drop(guard);
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}
