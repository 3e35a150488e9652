//! The MCP adapter: JSON-RPC 2.0 over streamable HTTP on a single endpoint.
//!
//! `initialize` mints a session id returned in the `Mcp-Session-Id` response
//! header; every later request must carry it back. The tool list is exactly
//! the registry's descriptors under their `{category}_{name}` names; admin
//! and health routes never appear here. Tool calls flow through the same
//! dispatch engine as REST; only the transport differs.

use crate::dispatch::DispatchOptions;
use crate::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostbridge_protocol::{Invocation, Protocol};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const SESSION_TTL_HOURS: i64 = 24;

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, chrono::DateTime<chrono::Utc>>>,
}

impl SessionTable {
    fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().expect("mcp session table poisoned");
        let now = chrono::Utc::now();
        sessions.retain(|_, last_seen| {
            now.signed_duration_since(*last_seen) < chrono::Duration::hours(SESSION_TTL_HOURS)
        });
        sessions.insert(id.clone(), now);
        id
    }

    fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("mcp session table poisoned");
        match sessions.get_mut(id) {
            Some(last_seen) => {
                *last_seen = chrono::Utc::now();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_error(id: Value, code: i64, message: &str, data: Option<Value>) -> Json<Value> {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    Json(json!({"jsonrpc": "2.0", "id": id, "error": error}))
}

pub async fn mcp_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return rpc_error(
                Value::Null,
                -32700,
                &format!("parse error: {e}"),
                None,
            )
            .into_response()
        }
    };
    if request.jsonrpc != "2.0" {
        return rpc_error(request.id, -32600, "jsonrpc must be \"2.0\"", None).into_response();
    }

    let session = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match request.method.as_str() {
        "initialize" => {
            let session_id = state.mcp_sessions.create();
            debug!(session_id = %session_id, "mcp session initialized");
            let client = request.params.get("clientInfo").cloned();
            let response = rpc_result(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "hostbridge",
                        "version": crate::api_meta::VERSION,
                    },
                    "capabilities": {"tools": {"listChanged": false}},
                    "_meta": {"client": client},
                }),
            );
            ([(SESSION_HEADER, session_id)], response).into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        method => {
            let Some(session_id) = session else {
                return rpc_error(request.id, -32000, "missing Mcp-Session-Id header", None)
                    .into_response();
            };
            if !state.mcp_sessions.touch(&session_id) {
                return rpc_error(request.id, -32000, "unknown or expired session", None)
                    .into_response();
            }
            match method {
                "ping" => rpc_result(request.id, json!({})).into_response(),
                "tools/list" => tools_list(&state, request.id).into_response(),
                "tools/call" => {
                    tools_call(&state, session_id, request.id, request.params)
                        .await
                        .into_response()
                }
                other => rpc_error(
                    request.id,
                    -32601,
                    &format!("method not found: {other}"),
                    None,
                )
                .into_response(),
            }
        }
    }
}

fn tools_list(state: &AppState, id: Value) -> Json<Value> {
    let tools: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|desc| {
            json!({
                "name": desc.mcp_name(),
                "description": desc.description,
                "inputSchema": desc.input_schema,
            })
        })
        .collect();
    rpc_result(id, json!({"tools": tools}))
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn tools_call(state: &AppState, session_id: String, id: Value, params: Value) -> Json<Value> {
    let call: CallParams = match serde_json::from_value(params) {
        Ok(c) => c,
        Err(e) => return rpc_error(id, -32602, &format!("invalid tool params: {e}"), None),
    };
    let Some(desc) = state.registry.get_mcp(&call.name) else {
        return rpc_error(id, -32601, &format!("unknown tool: {}", call.name), None);
    };
    let arguments = if call.arguments.is_null() {
        json!({})
    } else {
        call.arguments
    };
    let mut inv = Invocation::new(
        desc.category.clone(),
        desc.name.clone(),
        arguments,
        Protocol::Mcp,
    );
    inv.caller.client_id = Some(format!("mcp:{session_id}"));
    let result = state
        .dispatcher
        .dispatch(
            inv,
            DispatchOptions {
                cancel: CancellationToken::new(),
                ..Default::default()
            },
        )
        .await;
    match result {
        Ok(value) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
            rpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false,
                }),
            )
        }
        Err(err) => {
            let envelope = err.envelope();
            rpc_error(
                id,
                err.kind.jsonrpc_code(),
                &err.message,
                Some(serde_json::to_value(envelope).unwrap_or(Value::Null)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle() {
        let table = SessionTable::default();
        let id = table.create();
        assert!(table.touch(&id));
        assert!(!table.touch("not-a-session"));
    }

    #[test]
    fn rpc_error_embeds_envelope_data() {
        let err = crate::error::ToolError::blocked("Operation blocked: matched rule");
        let Json(body) = rpc_error(
            json!(1),
            err.kind.jsonrpc_code(),
            &err.message,
            Some(serde_json::to_value(err.envelope()).unwrap()),
        );
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["error"]["code"], -32002);
        assert_eq!(body["error"]["data"]["error_type"], "blocked");
    }
}
