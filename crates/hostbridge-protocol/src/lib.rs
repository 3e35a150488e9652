//! Wire types shared across the HostBridge surfaces.
//!
//! Everything here is protocol-independent: the REST and MCP adapters both
//! translate inbound requests into an [`Invocation`] and render failures from
//! the same [`ErrorKind`] taxonomy, so the two surfaces cannot drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable failure taxonomy. The string forms are part of the public API and
/// appear verbatim in the `error_type` field of every failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Security,
    Blocked,
    HitlRejected,
    HitlExpired,
    InvalidParameter,
    NotFound,
    Timeout,
    #[serde(rename = "internal_error")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Security => "security",
            ErrorKind::Blocked => "blocked",
            ErrorKind::HitlRejected => "hitl_rejected",
            ErrorKind::HitlExpired => "hitl_expired",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// HTTP status used by the REST surface for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Security | ErrorKind::Blocked | ErrorKind::HitlRejected => 403,
            ErrorKind::InvalidParameter => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout | ErrorKind::HitlExpired => 408,
            ErrorKind::Internal => 500,
        }
    }

    /// JSON-RPC error code used by the MCP surface for this kind.
    pub fn jsonrpc_code(self) -> i64 {
        match self {
            ErrorKind::InvalidParameter => -32602,
            ErrorKind::NotFound => -32601,
            ErrorKind::Internal => -32603,
            ErrorKind::Timeout | ErrorKind::HitlExpired => -32001,
            ErrorKind::Security | ErrorKind::Blocked | ErrorKind::HitlRejected => -32002,
        }
    }
}

/// Uniform failure envelope returned by both REST and MCP surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: bool,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion_tool: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_type: kind.as_str().to_string(),
            message: message.into(),
            suggestion: None,
            suggestion_tool: None,
        }
    }
}

/// Which adapter produced an invocation. Recorded verbatim in audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rest,
    Mcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Rest => "rest",
            Protocol::Mcp => "mcp",
        }
    }
}

/// Non-sensitive caller metadata carried for audit purposes only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// The canonical, protocol-independent form of a tool call inside the core.
///
/// Created by an adapter, consumed by the dispatch engine, discarded after
/// the audit row is written. `params` holds the request exactly as received:
/// secret templates are NOT expanded here so policy and audit see what the
/// caller sent.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: String,
    pub category: String,
    pub name: String,
    pub params: Value,
    pub protocol: Protocol,
    pub caller: CallerContext,
}

impl Invocation {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        params: Value,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            name: name.into(),
            params,
            protocol,
            caller: CallerContext::default(),
        }
    }

    /// Dotted tool coordinate, e.g. `fs.write`.
    pub fn tool(&self) -> String {
        format!("{}.{}", self.category, self.name)
    }
}

/// Lifecycle of a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl HitlStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HitlStatus::Pending => "pending",
            HitlStatus::Approved => "approved",
            HitlStatus::Rejected => "rejected",
            HitlStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, HitlStatus::Pending)
    }
}

/// Snapshot of an approval request as shown to admin subscribers. The
/// `request_params` field carries the pre-resolution template form so secret
/// values never reach a reviewer's screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequestView {
    pub id: String,
    pub created_at: String,
    pub ttl_seconds: u64,
    pub tool_category: String,
    pub tool_name: String,
    pub policy_rule_matched: String,
    pub request_params: Value,
    pub request_context: Value,
    pub status: HitlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_note: Option<String>,
}

/// Audit row statuses. Stored as plain strings in the kernel; these constants
/// keep publishers and queries aligned.
pub mod audit_status {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const BLOCKED: &str = "blocked";
    pub const HITL_APPROVED: &str = "hitl_approved";
    pub const HITL_REJECTED: &str = "hitl_rejected";
    pub const HITL_EXPIRED: &str = "hitl_expired";
}

/// One immutable record of a completed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub time: String,
    pub protocol: String,
    pub tool_category: String,
    pub tool_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Params as received, templates unexpanded. Never contains secret values.
    pub request_params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hitl_request_id: Option<String>,
}

impl AuditEntry {
    pub fn now_rfc3339() -> String {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}
