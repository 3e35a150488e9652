//! The dispatch engine: the single pipeline every invocation traverses,
//! regardless of transport.
//!
//! Order is contractual: descriptor lookup, policy on the *template* params,
//! block/HITL gates, secret expansion, schema validation, timed cancellable
//! handler call, audit. The audit row is written before the result returns
//! to the adapter, so an observer that has a response in hand will find the
//! matching entry. Exactly one audit row per invocation that reaches the
//! engine; handler bodies are never called for blocked, rejected, or expired
//! invocations.

use crate::config::HttpConfig;
use crate::error::ToolError;
use crate::hitl::{HitlManager, HitlOutcome};
use crate::plan::PlanService;
use crate::registry::{ToolContext, ToolRegistry};
use crate::secrets::SecretStore;
use crate::templates;
use crate::workspace::WorkspaceResolver;
use hostbridge_events::Bus;
use hostbridge_kernel::Kernel;
use hostbridge_policy::{PolicyAction, PolicyEngine};
use hostbridge_protocol::{audit_status, AuditEntry, ErrorKind, Invocation};
use hostbridge_topics as topics;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    policy: Arc<PolicyEngine>,
    secrets: Arc<SecretStore>,
    hitl: HitlManager,
    kernel: Kernel,
    bus: Bus,
    workspace: Arc<WorkspaceResolver>,
    http: Arc<HttpConfig>,
    plans: Arc<PlanService>,
    summary_bytes: usize,
    request_timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct DispatchOptions {
    /// Forces the HITL gate regardless of policy (plan `require_hitl`).
    pub force_hitl: bool,
    pub hitl_reason: Option<String>,
    pub cancel: CancellationToken,
}

pub struct DispatcherDeps {
    pub registry: Arc<ToolRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub secrets: Arc<SecretStore>,
    pub hitl: HitlManager,
    pub kernel: Kernel,
    pub bus: Bus,
    pub workspace: Arc<WorkspaceResolver>,
    pub http: Arc<HttpConfig>,
    pub plans: Arc<PlanService>,
    pub summary_bytes: usize,
    pub request_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        Self {
            registry: deps.registry,
            policy: deps.policy,
            secrets: deps.secrets,
            hitl: deps.hitl,
            kernel: deps.kernel,
            bus: deps.bus,
            workspace: deps.workspace,
            http: deps.http,
            plans: deps.plans,
            summary_bytes: deps.summary_bytes,
            request_timeout: deps.request_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        inv: Invocation,
        opts: DispatchOptions,
    ) -> Result<Value, ToolError> {
        let started = Instant::now();

        let desc = match self.registry.get(&inv.category, &inv.name) {
            Some(d) => d,
            None => {
                let err = ToolError::not_found(format!(
                    "Unknown tool '{}_{}'",
                    inv.category, inv.name
                ))
                .with_suggestion("List available tools via the tool catalog".to_string());
                self.write_audit(
                    &inv,
                    audit_status::ERROR,
                    Some(started.elapsed().as_millis() as i64),
                    Some(err.message.clone()),
                    None,
                    None,
                )
                .await;
                return Err(err);
            }
        };

        // Policy runs on the template form, before any secret expansion.
        let mut decision = if opts.force_hitl {
            hostbridge_policy::Decision::require_approval(
                opts.hitl_reason
                    .clone()
                    .unwrap_or_else(|| "Requires approval".to_string()),
            )
        } else {
            self.policy.evaluate(
                &inv.category,
                &inv.name,
                desc.primary_param_value(&inv.params),
                desc.requires_hitl_default,
            )
        };
        // Content gates (e.g. shell safety) escalate an allow to approval.
        if decision.action == PolicyAction::Allow {
            if let Some(gate) = desc.approval_gate {
                if let Some(reason) = gate(&inv.params) {
                    decision = hostbridge_policy::Decision::require_approval(reason);
                }
            }
        }

        let mut hitl_request_id: Option<String> = None;
        match decision.action {
            PolicyAction::Allow => {}
            PolicyAction::Block => {
                self.write_audit(
                    &inv,
                    audit_status::BLOCKED,
                    Some(started.elapsed().as_millis() as i64),
                    Some(decision.reason.clone()),
                    None,
                    None,
                )
                .await;
                return Err(ToolError::blocked(format!(
                    "Operation blocked: {}",
                    decision.reason
                )));
            }
            PolicyAction::RequireApproval => {
                info!(tool = %inv.tool(), reason = %decision.reason, "hitl required");
                let mut ttl = self.hitl.default_ttl();
                if let Some(limit) = self.request_timeout {
                    ttl = ttl.min(limit.as_secs().max(1));
                }
                let context = json!({
                    "protocol": inv.protocol.as_str(),
                    "client_id": inv.caller.client_id.clone(),
                });
                let outcome = self
                    .hitl
                    .submit(
                        &inv.id,
                        &inv.category,
                        &inv.name,
                        inv.params.clone(),
                        context,
                        &decision.reason,
                        Some(ttl),
                        &opts.cancel,
                    )
                    .await;
                match outcome {
                    HitlOutcome::Approved => {
                        hitl_request_id = Some(inv.id.clone());
                    }
                    HitlOutcome::Rejected => {
                        self.write_audit(
                            &inv,
                            audit_status::HITL_REJECTED,
                            Some(started.elapsed().as_millis() as i64),
                            Some("Operation rejected by administrator".to_string()),
                            None,
                            Some(inv.id.clone()),
                        )
                        .await;
                        return Err(ToolError::new(
                            ErrorKind::HitlRejected,
                            "Operation not permitted. The request was reviewed and rejected.",
                        ));
                    }
                    HitlOutcome::Expired => {
                        self.write_audit(
                            &inv,
                            audit_status::HITL_EXPIRED,
                            Some(started.elapsed().as_millis() as i64),
                            Some("Operation timed out waiting for approval".to_string()),
                            None,
                            Some(inv.id.clone()),
                        )
                        .await;
                        return Err(ToolError::timeout(
                            "Operation timed out waiting for approval. Please try again later.",
                        )
                        .with_suggestion(
                            "Retry the request or contact the administrator".to_string(),
                        ));
                    }
                    HitlOutcome::Cancelled => {
                        self.write_audit(
                            &inv,
                            audit_status::ERROR,
                            Some(started.elapsed().as_millis() as i64),
                            Some("Request cancelled while awaiting approval".to_string()),
                            None,
                            Some(inv.id.clone()),
                        )
                        .await;
                        return Err(ToolError::internal(
                            "Request cancelled while awaiting approval",
                        ));
                    }
                }
            }
        }

        // Secrets expand only after policy so audit keeps the template form.
        let resolved = match templates::resolve_secrets(&inv.params, &self.secrets) {
            Ok(v) => v,
            Err(err) => {
                self.write_audit(
                    &inv,
                    audit_status::ERROR,
                    Some(started.elapsed().as_millis() as i64),
                    Some(err.message.clone()),
                    None,
                    hitl_request_id,
                )
                .await;
                return Err(err);
            }
        };

        if let Err(err) = desc.validate(&resolved) {
            self.write_audit(
                &inv,
                audit_status::ERROR,
                Some(started.elapsed().as_millis() as i64),
                Some(err.message.clone()),
                None,
                hitl_request_id,
            )
            .await;
            return Err(err);
        }

        let ctx = ToolContext {
            workspace: self.workspace.clone(),
            secrets: self.secrets.clone(),
            kernel: self.kernel.clone(),
            http: self.http.clone(),
            plans: self.plans.clone(),
            registry: self.registry.clone(),
            cancel: opts.cancel.clone(),
        };
        let handler_fut = (desc.handler)(ctx, resolved);
        let remaining = self
            .request_timeout
            .map(|limit| limit.saturating_sub(started.elapsed()));
        let result = tokio::select! {
            _ = opts.cancel.cancelled() => Err(ToolError::internal("Request cancelled")),
            result = async {
                match remaining {
                    Some(rem) => match tokio::time::timeout(rem, handler_fut).await {
                        Ok(r) => r,
                        Err(_) => Err(ToolError::timeout(format!(
                            "Tool execution exceeded the {}s request timeout",
                            self.request_timeout.map(|d| d.as_secs()).unwrap_or_default()
                        ))),
                    },
                    None => handler_fut.await,
                }
            } => result,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(value) => {
                let summary = serde_json::to_string(&value)
                    .map(|s| truncate_to_bytes(&self.secrets.mask(&s), self.summary_bytes))
                    .ok();
                let status = if hitl_request_id.is_some() {
                    audit_status::HITL_APPROVED
                } else {
                    audit_status::SUCCESS
                };
                self.write_audit(&inv, status, Some(duration_ms), None, summary, hitl_request_id)
                    .await;
                Ok(value)
            }
            Err(mut err) => {
                // Mask any leaked secret values before the message is stored
                // or returned. Security refusals (workspace escape, SSRF)
                // happen during validation, before any side effect, and are
                // recorded as blocked.
                let masked = self.secrets.mask(&err.message);
                let status = if err.kind == ErrorKind::Security {
                    audit_status::BLOCKED
                } else {
                    audit_status::ERROR
                };
                self.write_audit(
                    &inv,
                    status,
                    Some(duration_ms),
                    Some(masked.clone()),
                    None,
                    hitl_request_id,
                )
                .await;
                if err.kind == ErrorKind::Internal {
                    // Unclassified failures reach the caller as a generic
                    // string; the original text lives in the audit row only.
                    err.message =
                        "An unexpected error occurred. Please check the logs.".to_string();
                } else {
                    err.message = masked;
                }
                Err(err)
            }
        }
    }

    async fn write_audit(
        &self,
        inv: &Invocation,
        status: &str,
        duration_ms: Option<i64>,
        error_message: Option<String>,
        response_summary: Option<String>,
        hitl_request_id: Option<String>,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            time: AuditEntry::now_rfc3339(),
            protocol: inv.protocol.as_str().to_string(),
            tool_category: inv.category.clone(),
            tool_name: inv.name.clone(),
            status: status.to_string(),
            duration_ms,
            error_message,
            request_params: inv.params.clone(),
            response_summary,
            hitl_request_id,
        };
        if let Err(e) = self.kernel.append_audit_async(entry.clone()).await {
            warn!(error = %e, tool = %inv.tool(), "audit append failed");
        }
        self.bus.publish(topics::TOPIC_AUDIT_APPENDED, &entry);
    }
}

fn truncate_to_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolDescriptor;
    use hostbridge_kernel::AuditQuery;
    use hostbridge_policy::{PolicyAction, PolicyRule};
    use hostbridge_protocol::Protocol;
    use std::io::Write as _;

    struct Harness {
        dispatcher: Dispatcher,
        hitl: HitlManager,
        kernel: Kernel,
        _dirs: (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir),
    }

    fn harness(rules: Vec<PolicyRule>, request_timeout: Option<Duration>) -> Harness {
        let state = tempfile::tempdir().unwrap();
        let ws_dir = tempfile::tempdir().unwrap();
        let secrets_dir = tempfile::tempdir().unwrap();
        let secrets_path = secrets_dir.path().join("secrets.env");
        let mut f = std::fs::File::create(&secrets_path).unwrap();
        f.write_all(b"API_KEY=sekret\n").unwrap();

        let kernel = Kernel::open(state.path()).unwrap();
        let bus = Bus::new(64);
        let hitl = HitlManager::new(bus.clone(), 300);
        let secrets = Arc::new(SecretStore::load(secrets_path));
        let workspace = Arc::new(WorkspaceResolver::new(ws_dir.path()).unwrap());
        let plans = Arc::new(PlanService::new(bus.clone()));

        let echo_schema = json!({
            "type": "object",
            "properties": {"value": {"type": "string"}},
            "required": ["value"],
        });
        let descriptors = vec![
            ToolDescriptor::new(
                "test",
                "echo",
                "echo the value back",
                echo_schema.clone(),
                false,
                Some("value"),
                Arc::new(|_ctx, params| {
                    Box::pin(async move { Ok(json!({"echo": params["value"]})) })
                }),
            ),
            ToolDescriptor::new(
                "test",
                "fail",
                "always fails classified",
                echo_schema.clone(),
                false,
                Some("value"),
                Arc::new(|_ctx, _params| {
                    Box::pin(async move {
                        Err(ToolError::not_found("File not found: x. Leaked: sekret"))
                    })
                }),
            ),
            ToolDescriptor::new(
                "test",
                "boom",
                "always fails unclassified",
                echo_schema.clone(),
                false,
                Some("value"),
                Arc::new(|_ctx, _params| {
                    Box::pin(async move { Err(ToolError::internal("index out of bounds")) })
                }),
            ),
            ToolDescriptor::new(
                "test",
                "gated",
                "hitl by default",
                echo_schema,
                true,
                Some("value"),
                Arc::new(|_ctx, params| {
                    Box::pin(async move { Ok(json!({"ran": params["value"]})) })
                }),
            ),
        ];
        let registry = Arc::new(ToolRegistry::new(descriptors));
        let dispatcher = Dispatcher::new(DispatcherDeps {
            registry,
            policy: Arc::new(PolicyEngine::new(rules)),
            secrets,
            hitl: hitl.clone(),
            kernel: kernel.clone(),
            bus,
            workspace,
            http: Arc::new(HttpConfig::default()),
            plans,
            summary_bytes: 256,
            request_timeout,
        });
        Harness {
            dispatcher,
            hitl,
            kernel,
            _dirs: (state, ws_dir, secrets_dir),
        }
    }

    fn inv(name: &str, params: Value) -> Invocation {
        Invocation::new("test", name, params, Protocol::Rest)
    }

    async fn audit_rows(kernel: &Kernel) -> Vec<AuditEntry> {
        kernel
            .query_audit_async(AuditQuery {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn success_writes_one_audit_row() {
        let h = harness(vec![], None);
        let out = h
            .dispatcher
            .dispatch(inv("echo", json!({"value": "hi"})), DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(out["echo"], "hi");
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "success");
        assert_eq!(rows[0].tool_category, "test");
        assert!(rows[0].response_summary.as_deref().unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn block_rule_prevents_handler_and_audits_blocked() {
        let rules = vec![PolicyRule {
            category: "test".into(),
            name: Some("echo".into()),
            param_pattern: Some("*.env".into()),
            action: PolicyAction::Block,
            reason: "Matches block pattern".into(),
        }];
        let h = harness(rules, None);
        let err = h
            .dispatcher
            .dispatch(
                inv("echo", json!({"value": "prod.env"})),
                DispatchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Blocked);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "blocked");
    }

    #[tokio::test]
    async fn audit_keeps_secret_templates_unexpanded() {
        let h = harness(vec![], None);
        let out = h
            .dispatcher
            .dispatch(
                inv("echo", json!({"value": "token={{secret:API_KEY}}"})),
                DispatchOptions::default(),
            )
            .await
            .unwrap();
        // Handler saw the resolved value...
        assert_eq!(out["echo"], "token=sekret");
        // ...but the audit row kept the template, and the summary is masked.
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(
            rows[0].request_params["value"],
            "token={{secret:API_KEY}}"
        );
        let summary = rows[0].response_summary.as_deref().unwrap();
        assert!(!summary.contains("sekret"));
        assert!(summary.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn unknown_secret_key_fails_before_handler() {
        let h = harness(vec![], None);
        let err = h
            .dispatcher
            .dispatch(
                inv("echo", json!({"value": "{{secret:NOPE}}"})),
                DispatchOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows[0].status, "error");
    }

    #[tokio::test]
    async fn schema_violation_audits_error() {
        let h = harness(vec![], None);
        let err = h
            .dispatcher
            .dispatch(inv("echo", json!({"value": 7})), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(err.schema_violation);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows[0].status, "error");
    }

    #[tokio::test]
    async fn classified_error_is_masked_and_audited() {
        let h = harness(vec![], None);
        let err = h
            .dispatcher
            .dispatch(inv("fail", json!({"value": "x"})), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.message.contains("sekret"));
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows[0].status, "error");
        assert!(!rows[0].error_message.as_deref().unwrap().contains("sekret"));
    }

    #[tokio::test]
    async fn internal_error_is_redacted_for_caller_but_kept_in_audit() {
        let h = harness(vec![], None);
        let err = h
            .dispatcher
            .dispatch(inv("boom", json!({"value": "x"})), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("unexpected error"));
        let rows = audit_rows(&h.kernel).await;
        assert!(rows[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("index out of bounds"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found_with_audit() {
        let h = harness(vec![], None);
        let err = h
            .dispatcher
            .dispatch(inv("nope", json!({})), DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "error");
    }

    #[tokio::test]
    async fn hitl_approved_runs_handler_and_audits_hitl_approved() {
        let h = harness(vec![], None);
        let hitl = h.hitl.clone();
        let approve = tokio::spawn(async move {
            for _ in 0..200 {
                let pending = hitl.list_pending();
                if let Some(req) = pending.first() {
                    hitl.decide(&req.id, true, "admin", None).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no pending hitl request appeared");
        });
        let out = h
            .dispatcher
            .dispatch(inv("gated", json!({"value": "x"})), DispatchOptions::default())
            .await
            .unwrap();
        approve.await.unwrap();
        assert_eq!(out["ran"], "x");
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "hitl_approved");
        assert!(rows[0].hitl_request_id.is_some());
    }

    #[tokio::test]
    async fn hitl_rejected_never_calls_handler() {
        let h = harness(vec![], None);
        let hitl = h.hitl.clone();
        let reject = tokio::spawn(async move {
            for _ in 0..200 {
                let pending = hitl.list_pending();
                if let Some(req) = pending.first() {
                    hitl.decide(&req.id, false, "admin", Some("nope".into())).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no pending hitl request appeared");
        });
        let err = h
            .dispatcher
            .dispatch(inv("gated", json!({"value": "x"})), DispatchOptions::default())
            .await
            .unwrap_err();
        reject.await.unwrap();
        assert_eq!(err.kind, ErrorKind::HitlRejected);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows[0].status, "hitl_rejected");
    }

    #[tokio::test]
    async fn force_hitl_expiry_surfaces_timeout_and_audits_hitl_expired() {
        let h = harness(vec![], Some(Duration::from_secs(1)));
        let err = h
            .dispatcher
            .dispatch(
                inv("echo", json!({"value": "x"})),
                DispatchOptions {
                    force_hitl: true,
                    hitl_reason: Some("test gate".into()),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        let rows = audit_rows(&h.kernel).await;
        assert_eq!(rows[0].status, "hitl_expired");
    }

    #[test]
    fn truncation_is_char_boundary_safe() {
        let s = "héllo wörld".repeat(50);
        let out = truncate_to_bytes(&s, 16);
        assert!(out.ends_with("[truncated]"));
        let exact = truncate_to_bytes("short", 16);
        assert_eq!(exact, "short");
    }
}
