//! Configuration: built-in defaults, overlaid by a TOML file, overlaid by
//! `HOSTBRIDGE_*` environment variables (highest precedence).

use hostbridge_policy::{PolicyAction, PolicyRule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Admin surface credential. Empty disables the check (local dev).
    pub admin_token: String,
    pub max_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            admin_token: String::new(),
            max_concurrency: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspace"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub file: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("secrets.env"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    pub default_ttl_seconds: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub retention_days: u32,
    /// Byte budget for the recorded response summary.
    pub response_summary_bytes: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            response_summary_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub block_private_ips: bool,
    pub block_metadata_endpoints: bool,
    /// Exact or `*.example.com` globs; empty list permits any domain.
    pub allow_domains: Vec<String>,
    /// Applied after the allowlist.
    pub block_domains: Vec<String>,
    pub default_timeout: u64,
    pub max_timeout: u64,
    pub max_response_size_kb: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            block_private_ips: true,
            block_metadata_endpoints: true,
            allow_domains: Vec::new(),
            block_domains: Vec::new(),
            default_timeout: 30,
            max_timeout: 120,
            max_response_size_kb: 512,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolPolicyConfig {
    /// "allow" | "block" | "hitl"; empty means no base rule.
    pub policy: String,
    /// Globs applied to the tool's primary param that force approval.
    pub hitl_patterns: Vec<String>,
    /// Globs applied to the tool's primary param that block outright.
    pub block_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub secrets: SecretsConfig,
    pub hitl: HitlConfig,
    pub audit: AuditConfig,
    pub http: HttpConfig,
    /// `tools.<category>.<name>` policy overrides.
    pub tools: BTreeMap<String, BTreeMap<String, ToolPolicyConfig>>,
    /// Optional per-request execution timeout covering the whole dispatch.
    pub request_timeout_seconds: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            workspace: WorkspaceConfig::default(),
            secrets: SecretsConfig::default(),
            hitl: HitlConfig::default(),
            audit: AuditConfig::default(),
            http: HttpConfig::default(),
            tools: BTreeMap::new(),
            request_timeout_seconds: None,
        }
    }
}

impl Config {
    /// Load the config file named by `HOSTBRIDGE_CONFIG` (default
    /// `hostbridge.toml`, missing file means defaults), then apply env
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("HOSTBRIDGE_CONFIG").unwrap_or_else(|_| "hostbridge.toml".into());
        let mut cfg: Config = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HOSTBRIDGE_BIND") {
            if !v.is_empty() {
                self.server.bind = v;
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_PORT") {
            if let Ok(port) = v.trim().parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_ADMIN_TOKEN") {
            self.server.admin_token = v;
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_WORKSPACE") {
            if !v.is_empty() {
                self.workspace.root = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_SECRETS_FILE") {
            if !v.is_empty() {
                self.secrets.file = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_HITL_TTL") {
            if let Ok(ttl) = v.trim().parse() {
                self.hitl.default_ttl_seconds = ttl;
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_AUDIT_RETENTION_DAYS") {
            if let Ok(days) = v.trim().parse() {
                self.audit.retention_days = days;
            }
        }
        if let Ok(v) = std::env::var("HOSTBRIDGE_REQUEST_TIMEOUT") {
            if let Ok(secs) = v.trim().parse() {
                self.request_timeout_seconds = Some(secs);
            }
        }
    }

    /// Compile the `tools.*` table into the ordered policy rule list. For
    /// each tool, block patterns come first, then HITL patterns, then the
    /// base policy; rule order across tools follows the (sorted) table order.
    pub fn policy_rules(&self) -> Vec<PolicyRule> {
        let mut rules = Vec::new();
        for (category, tools) in &self.tools {
            for (name, policy) in tools {
                for pattern in &policy.block_patterns {
                    rules.push(PolicyRule {
                        category: category.clone(),
                        name: Some(name.clone()),
                        param_pattern: Some(pattern.clone()),
                        action: PolicyAction::Block,
                        reason: format!("Matches block pattern '{pattern}'"),
                    });
                }
                for pattern in &policy.hitl_patterns {
                    rules.push(PolicyRule {
                        category: category.clone(),
                        name: Some(name.clone()),
                        param_pattern: Some(pattern.clone()),
                        action: PolicyAction::RequireApproval,
                        reason: format!("Matches HITL pattern '{pattern}'"),
                    });
                }
                match policy.policy.as_str() {
                    "block" => rules.push(PolicyRule {
                        category: category.clone(),
                        name: Some(name.clone()),
                        param_pattern: None,
                        action: PolicyAction::Block,
                        reason: "Tool is blocked by policy".into(),
                    }),
                    "hitl" => rules.push(PolicyRule {
                        category: category.clone(),
                        name: Some(name.clone()),
                        param_pattern: None,
                        action: PolicyAction::RequireApproval,
                        reason: "Tool requires approval by policy".into(),
                    }),
                    "allow" => rules.push(PolicyRule {
                        category: category.clone(),
                        name: Some(name.clone()),
                        param_pattern: None,
                        action: PolicyAction::Allow,
                        reason: "Tool is allowed by policy".into(),
                    }),
                    _ => {}
                }
            }
        }
        rules
    }

    pub fn state_dir() -> PathBuf {
        PathBuf::from(std::env::var("HOSTBRIDGE_STATE_DIR").unwrap_or_else(|_| "state".into()))
    }
}
