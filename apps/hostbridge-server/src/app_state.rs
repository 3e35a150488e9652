//! The composition root: builds Config, Secrets, Kernel, Bus, HITL, the
//! registry, and the dispatch engine once at startup and hands clones to the
//! adapters. No global mutable state lives anywhere in the core.

use crate::config::Config;
use crate::dispatch::{Dispatcher, DispatcherDeps};
use crate::hitl::HitlManager;
use crate::mcp::SessionTable;
use crate::plan::PlanService;
use crate::registry::ToolRegistry;
use crate::secrets::SecretStore;
use crate::tools;
use crate::workspace::WorkspaceResolver;
use axum::http::HeaderMap;
use hostbridge_events::Bus;
use hostbridge_kernel::Kernel;
use hostbridge_policy::PolicyEngine;
use hostbridge_topics as topics;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Bus,
    pub kernel: Kernel,
    pub secrets: Arc<SecretStore>,
    pub workspace: Arc<WorkspaceResolver>,
    pub hitl: HitlManager,
    pub registry: Arc<ToolRegistry>,
    pub dispatcher: Dispatcher,
    pub plans: Arc<PlanService>,
    pub mcp_sessions: Arc<SessionTable>,
    pub started_at: Instant,
}

pub fn build(config: Config) -> anyhow::Result<AppState> {
    let state_dir = Config::state_dir();
    build_with(config, &state_dir)
}

pub fn build_with(config: Config, state_dir: &Path) -> anyhow::Result<AppState> {
    let config = Arc::new(config);
    let bus = Bus::new_with_replay(256, 256);
    let kernel = Kernel::open(state_dir)?;
    let secrets = Arc::new(SecretStore::load(config.secrets.file.clone()));
    let workspace = Arc::new(WorkspaceResolver::new(&config.workspace.root)?);
    let policy = Arc::new(PolicyEngine::new(config.policy_rules()));
    let hitl = HitlManager::new(bus.clone(), config.hitl.default_ttl_seconds);
    let plans = Arc::new(PlanService::new(bus.clone()));
    let registry = Arc::new(ToolRegistry::new(tools::all_descriptors()));

    let dispatcher = Dispatcher::new(DispatcherDeps {
        registry: registry.clone(),
        policy,
        secrets: secrets.clone(),
        hitl: hitl.clone(),
        kernel: kernel.clone(),
        bus: bus.clone(),
        workspace: workspace.clone(),
        http: Arc::new(config.http.clone()),
        plans: plans.clone(),
        summary_bytes: config.audit.response_summary_bytes,
        request_timeout: config.request_timeout_seconds.map(Duration::from_secs),
    });
    plans.bind_dispatcher(dispatcher.clone());

    info!(
        tools = registry.len(),
        workspace = %workspace.root().display(),
        "hostbridge state assembled"
    );
    Ok(AppState {
        config,
        bus,
        kernel,
        secrets,
        workspace,
        hitl,
        registry,
        dispatcher,
        plans,
        mcp_sessions: Arc::new(SessionTable::default()),
        started_at: Instant::now(),
    })
}

impl AppState {
    /// Admin check: with a configured token, require it via
    /// `Authorization: Bearer` or `X-HostBridge-Admin`. No token means the
    /// check passes (local development).
    pub fn admin_ok(&self, headers: &HeaderMap) -> bool {
        let token = &self.config.server.admin_token;
        if token.is_empty() {
            return true;
        }
        if let Some(hv) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
        {
            if let Some(bearer) = hv.strip_prefix("Bearer ") {
                if bearer == token {
                    return true;
                }
            }
        }
        if let Some(hv) = headers.get("X-HostBridge-Admin").and_then(|h| h.to_str().ok()) {
            if hv == token {
                return true;
            }
        }
        false
    }

    /// Start the HITL sweeper and the audit retention sweep.
    pub fn start_background_jobs(&self) {
        self.hitl.start_sweeper();
        let kernel = self.kernel.clone();
        let bus = self.bus.clone();
        let retention_days = self.config.audit.retention_days;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                match kernel.prune_audit_async(retention_days).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        info!(removed, retention_days, "audit retention sweep");
                        bus.publish(
                            topics::TOPIC_AUDIT_PRUNED,
                            &json!({"removed": removed, "retention_days": retention_days}),
                        );
                    }
                    Err(e) => warn!(error = %e, "audit retention sweep failed"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolPolicyConfig;
    use crate::dispatch::DispatchOptions;
    use hostbridge_kernel::AuditQuery;
    use hostbridge_protocol::{ErrorKind, Invocation, Protocol};
    use serde_json::Value;

    struct TestServer {
        state: AppState,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn server() -> TestServer {
        server_with(|_cfg| {})
    }

    fn server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
        let state_dir = tempfile::tempdir().unwrap();
        let ws_dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.workspace.root = ws_dir.path().to_path_buf();
        cfg.secrets.file = state_dir.path().join("secrets.env");
        std::fs::write(&cfg.secrets.file, "TOKEN=shhh\n").unwrap();
        tweak(&mut cfg);
        let state = build_with(cfg, state_dir.path()).unwrap();
        TestServer {
            state,
            _dirs: (state_dir, ws_dir),
        }
    }

    async fn call(state: &AppState, category: &str, name: &str, params: Value) -> Result<Value, crate::error::ToolError> {
        state
            .dispatcher
            .dispatch(
                Invocation::new(category, name, params, Protocol::Rest),
                DispatchOptions::default(),
            )
            .await
    }

    #[tokio::test]
    async fn fs_write_and_read_through_the_full_pipeline() {
        let srv = server();
        let out = call(
            &srv.state,
            "fs",
            "write",
            json!({"path": "hello.txt", "content": "x=1"}),
        )
        .await
        .unwrap();
        assert_eq!(out["bytes_written"], 3);
        let out = call(&srv.state, "fs", "read", json!({"path": "hello.txt"}))
            .await
            .unwrap();
        assert_eq!(out["content"], "x=1");
        // Two audit rows, newest first.
        let rows = srv
            .state
            .kernel
            .query_audit_async(AuditQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == "success"));
    }

    #[tokio::test]
    async fn workspace_escape_is_blocked_end_to_end() {
        let srv = server();
        let err = call(
            &srv.state,
            "fs",
            "read",
            json!({"path": "../../etc/passwd"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Security);
        assert!(err.message.contains("workspace"));
        let rows = srv
            .state
            .kernel
            .query_audit_async(AuditQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "blocked");
    }

    #[tokio::test]
    async fn configured_hitl_pattern_gates_fs_write() {
        let srv = server_with(|cfg| {
            cfg.tools
                .entry("fs".into())
                .or_default()
                .insert(
                    "write".into(),
                    ToolPolicyConfig {
                        policy: "allow".into(),
                        hitl_patterns: vec!["*.conf".into()],
                        block_patterns: vec![],
                    },
                );
        });
        let state = srv.state.clone();
        let hitl = state.hitl.clone();
        let approver = tokio::spawn(async move {
            for _ in 0..400 {
                if let Some(req) = hitl.list_pending().first() {
                    assert_eq!(req.tool_category, "fs");
                    hitl.decide(&req.id, true, "admin", None).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("hitl request never appeared");
        });
        let out = call(
            &state,
            "fs",
            "write",
            json!({"path": "app.conf", "content": "x=1"}),
        )
        .await
        .unwrap();
        approver.await.unwrap();
        assert_eq!(out["bytes_written"], 3);
        assert!(state.workspace.root().join("app.conf").exists());
        let rows = state
            .kernel
            .query_audit_async(AuditQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows[0].status, "hitl_approved");
    }

    #[tokio::test]
    async fn plan_parallel_with_task_reference() {
        let srv = server();
        let created = call(
            &srv.state,
            "plan",
            "create",
            json!({
                "name": "write-two",
                "on_failure": "stop",
                "tasks": [
                    {
                        "id": "A",
                        "tool_category": "fs",
                        "tool_name": "write",
                        "params": {"path": "a.txt", "content": "hi"},
                    },
                    {
                        "id": "B",
                        "tool_category": "fs",
                        "tool_name": "write",
                        "params": {"path": "b.txt", "content": "{{task:A.bytes_written}}"},
                        "depends_on": ["A"],
                    },
                ],
            }),
        )
        .await
        .unwrap();
        let plan_id = created["plan_id"].as_str().unwrap().to_string();
        assert_eq!(created["execution_levels"], 2);

        let summary = call(&srv.state, "plan", "execute", json!({"plan_id": plan_id}))
            .await
            .unwrap();
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["tasks_completed"], 2);
        // B received A's numeric output stringified into its content.
        let b = std::fs::read_to_string(srv.state.workspace.root().join("b.txt")).unwrap();
        assert_eq!(b, "2");

        // Executing by (unique) name hits the already-finished guard, which
        // shows the name resolved to the same plan.
        let err = call(&srv.state, "plan", "execute", json!({"plan_id": "write-two"}))
            .await
            .unwrap_err();
        assert!(err.message.contains("already finished"));
    }

    #[tokio::test]
    async fn plan_skip_dependents_policy() {
        let srv = server();
        let created = call(
            &srv.state,
            "plan",
            "create",
            json!({
                "name": "skip-deps",
                "on_failure": "skip_dependents",
                "tasks": [
                    // A fails: mode create over an existing file.
                    {
                        "id": "A",
                        "tool_category": "fs",
                        "tool_name": "write",
                        "params": {"path": "existing.txt", "content": "x"},
                    },
                    {
                        "id": "B",
                        "tool_category": "fs",
                        "tool_name": "write",
                        "params": {"path": "b.txt", "content": "b"},
                        "depends_on": ["A"],
                    },
                    {
                        "id": "C",
                        "tool_category": "fs",
                        "tool_name": "write",
                        "params": {"path": "c.txt", "content": "c"},
                    },
                ],
            }),
        )
        .await
        .unwrap();
        std::fs::write(srv.state.workspace.root().join("existing.txt"), "old").unwrap();
        let plan_id = created["plan_id"].as_str().unwrap().to_string();
        let summary = call(&srv.state, "plan", "execute", json!({"plan_id": plan_id.clone()}))
            .await
            .unwrap();
        assert_eq!(summary["status"], "failed");
        assert_eq!(summary["tasks_failed"], 1);
        assert_eq!(summary["tasks_skipped"], 1);
        assert_eq!(summary["tasks_completed"], 1);

        let status = call(&srv.state, "plan", "status", json!({"plan_id": plan_id}))
            .await
            .unwrap();
        let by_id: std::collections::HashMap<&str, &str> = status["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| (t["id"].as_str().unwrap(), t["status"].as_str().unwrap()))
            .collect();
        assert_eq!(by_id["A"], "failed");
        assert_eq!(by_id["B"], "skipped");
        assert_eq!(by_id["C"], "completed");
    }

    #[tokio::test]
    async fn plan_cycle_rejected_before_execution() {
        let srv = server();
        let err = call(
            &srv.state,
            "plan",
            "create",
            json!({
                "name": "cyclic",
                "tasks": [
                    {"id": "A", "tool_category": "fs", "tool_name": "write",
                     "params": {}, "depends_on": ["B"]},
                    {"id": "B", "tool_category": "fs", "tool_name": "write",
                     "params": {}, "depends_on": ["A"]},
                ],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        // Nothing executed, nothing audited beyond the failed create.
        let rows = srv
            .state
            .kernel
            .query_audit_async(AuditQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tool_name, "create");
        assert_eq!(rows[0].status, "error");
    }

    #[tokio::test]
    async fn memory_subtree_scenario_through_dispatch() {
        let srv = server();
        let p = call(&srv.state, "memory", "store", json!({"content": "P"}))
            .await
            .unwrap();
        let p_id = p["id"].as_str().unwrap().to_string();
        let c = call(&srv.state, "memory", "store", json!({"content": "C"}))
            .await
            .unwrap();
        let c_id = c["id"].as_str().unwrap().to_string();
        call(
            &srv.state,
            "memory",
            "link",
            json!({"source_id": p_id.clone(), "target_id": c_id.clone(), "relation": "parent_of"}),
        )
        .await
        .unwrap();

        let sub = call(&srv.state, "memory", "subtree", json!({"id": p_id.clone()}))
            .await
            .unwrap();
        assert_eq!(sub["total"], 1);
        assert_eq!(sub["nodes"][0]["id"].as_str(), Some(c_id.as_str()));

        let anc = call(&srv.state, "memory", "ancestors", json!({"id": c_id}))
            .await
            .unwrap();
        assert_eq!(anc["nodes"][0]["id"].as_str(), Some(p_id.as_str()));
    }

    #[tokio::test]
    async fn admin_token_guard() {
        let srv = server_with(|cfg| cfg.server.admin_token = "tok".into());
        let mut headers = HeaderMap::new();
        assert!(!srv.state.admin_ok(&headers));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok".parse().unwrap(),
        );
        assert!(srv.state.admin_ok(&headers));
        let mut headers = HeaderMap::new();
        headers.insert("X-HostBridge-Admin", "tok".parse().unwrap());
        assert!(srv.state.admin_ok(&headers));
        let mut headers = HeaderMap::new();
        headers.insert("X-HostBridge-Admin", "wrong".parse().unwrap());
        assert!(!srv.state.admin_ok(&headers));
    }
}
