//! Admin surface: HITL queue management, audit queries and export, secret
//! key listing and reload, tool catalog. Token-guarded; with no token
//! configured the check is a no-op (local development).

use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostbridge_kernel::AuditQuery;
use hostbridge_protocol::AuditEntry;
use hostbridge_topics as topics;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": true, "error_type": "unauthorized", "message": "Admin token required"})),
    )
        .into_response()
}

// ------------------------------------------------------------------
// HITL queue
// ------------------------------------------------------------------

pub async fn hitl_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let pending = state.hitl.list_pending();
    let total = pending.len();
    Json(json!({"pending": pending, "total": total})).into_response()
}

pub async fn hitl_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    match state.hitl.snapshot(&id) {
        Some(view) => Json(view).into_response(),
        None => crate::error::ToolError::not_found(format!("HITL request '{id}' not found"))
            .into_response(),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct HitlDecision {
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[utoipa::path(
    post,
    path = "/admin/hitl/{id}/approve",
    tag = "HITL",
    params(("id" = String, Path, description = "Pending request id")),
    request_body = HitlDecision,
    responses(
        (status = 200, description = "Request approved", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Not pending")
    )
)]
pub async fn hitl_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<HitlDecision>,
) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let reviewer = body.reviewer.unwrap_or_else(|| "admin".to_string());
    match state.hitl.decide(&id, true, &reviewer, body.note) {
        Ok(view) => Json(json!({"ok": true, "request": view})).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/admin/hitl/{id}/reject",
    tag = "HITL",
    params(("id" = String, Path, description = "Pending request id")),
    request_body = HitlDecision,
    responses(
        (status = 200, description = "Request rejected", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Not pending")
    )
)]
pub async fn hitl_reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<HitlDecision>,
) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let reviewer = body.reviewer.unwrap_or_else(|| "admin".to_string());
    match state.hitl.decide(&id, false, &reviewer, body.note) {
        Ok(view) => Json(json!({"ok": true, "request": view})).into_response(),
        Err(err) => err.into_response(),
    }
}

// ------------------------------------------------------------------
// Audit queries and export
// ------------------------------------------------------------------

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub format: Option<String>,
}

impl AuditParams {
    fn to_query(&self) -> AuditQuery {
        AuditQuery {
            category: self.category.clone(),
            name: self.name.clone(),
            status: self.status.clone(),
            q: self.q.clone(),
            since: self.since.clone(),
            until: self.until.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

pub async fn audit_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuditParams>,
) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    match state.kernel.query_audit_async(params.to_query()).await {
        Ok(entries) => {
            let total = entries.len();
            Json(json!({"entries": entries, "total": total})).into_response()
        }
        Err(e) => crate::error::ToolError::internal(e.to_string()).into_response(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn entries_to_csv(entries: &[AuditEntry]) -> String {
    let mut out = String::from(
        "id,time,protocol,tool_category,tool_name,status,duration_ms,error_message,hitl_request_id\n",
    );
    for e in entries {
        let duration = e.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let row = [
            e.id.as_str(),
            e.time.as_str(),
            e.protocol.as_str(),
            e.tool_category.as_str(),
            e.tool_name.as_str(),
            e.status.as_str(),
            duration.as_str(),
            e.error_message.as_deref().unwrap_or(""),
            e.hitl_request_id.as_deref().unwrap_or(""),
        ]
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",");
        out.push_str(&row);
        out.push('\n');
    }
    out
}

#[utoipa::path(
    get,
    path = "/admin/audit/export",
    tag = "Audit",
    responses(
        (status = 200, description = "Filtered audit entries as JSON or CSV"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn audit_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuditParams>,
) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let mut query = params.to_query();
    query.limit = query.limit.max(1000);
    let entries = match state.kernel.query_audit_async(query).await {
        Ok(entries) => entries,
        Err(e) => return crate::error::ToolError::internal(e.to_string()).into_response(),
    };
    match params.format.as_deref().unwrap_or("json") {
        "csv" => (
            [(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            entries_to_csv(&entries),
        )
            .into_response(),
        _ => Json(json!({"entries": entries})).into_response(),
    }
}

// ------------------------------------------------------------------
// Secrets
// ------------------------------------------------------------------

pub async fn secrets_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let keys = state.secrets.list_keys();
    let total = keys.len();
    Json(json!({"keys": keys, "total": total})).into_response()
}

pub async fn secrets_reload(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let count = state.secrets.reload();
    state
        .bus
        .publish(topics::TOPIC_SECRETS_RELOADED, &json!({"count": count}));
    Json(json!({"ok": true, "count": count})).into_response()
}

// ------------------------------------------------------------------
// Tool catalog
// ------------------------------------------------------------------

pub async fn tools_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.admin_ok(&headers) {
        return unauthorized();
    }
    let tools: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .map(|desc| {
            json!({
                "category": desc.category,
                "name": desc.name,
                "mcp_name": desc.mcp_name(),
                "description": desc.description,
                "input_schema": desc.input_schema,
                "requires_hitl_default": desc.requires_hitl_default,
            })
        })
        .collect();
    let total = tools.len();
    Json(json!({"tools": tools, "total": total})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escaping_handles_commas_and_quotes() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_rows_match_entry_fields() {
        let entry = AuditEntry {
            id: "e1".into(),
            time: "2026-01-01T00:00:00.000Z".into(),
            protocol: "rest".into(),
            tool_category: "fs".into(),
            tool_name: "write".into(),
            status: "blocked".into(),
            duration_ms: Some(2),
            error_message: Some("blocked, reason".into()),
            request_params: json!({}),
            response_summary: None,
            hitl_request_id: None,
        };
        let csv = entries_to_csv(&[entry]);
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,time"));
        let row = lines.next().unwrap();
        assert!(row.contains("e1"));
        assert!(row.contains("\"blocked, reason\""));
    }
}
