//! Policy engine for tool execution control.
//!
//! Rules are evaluated top to bottom and the first match wins. A rule may
//! match a whole category, a specific tool, or a specific tool with a glob
//! pattern applied to the tool's primary parameter (normally `path`).
//! Evaluation is pure and synchronous; no rule ever sees resolved secrets
//! because the dispatch engine consults policy before template expansion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    RequireApproval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    pub category: String,
    /// `None` matches every tool in the category.
    #[serde(default)]
    pub name: Option<String>,
    /// Glob applied to the tool's primary parameter; `None` matches any value.
    #[serde(default)]
    pub param_pattern: Option<String>,
    pub action: PolicyAction,
    pub reason: String,
}

impl PolicyRule {
    fn matches(&self, category: &str, name: &str, primary_param: Option<&str>) -> bool {
        if self.category != category {
            return false;
        }
        if let Some(rule_name) = &self.name {
            if rule_name != name {
                return false;
            }
        }
        if let Some(pattern) = &self.param_pattern {
            match primary_param {
                Some(value) => glob_match(pattern, value),
                None => false,
            }
        } else {
            true
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Decision {
    pub action: PolicyAction,
    pub reason: String,
    /// Index of the matched rule, absent when the tool default decided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            reason: "default allow".to_string(),
            rule_index: None,
        }
    }

    pub fn require_approval(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::RequireApproval,
            reason: reason.into(),
            rule_index: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Evaluate the ordered rule list. When no rule matches,
    /// `requires_hitl_default` (from the tool descriptor) decides between
    /// allow and require-approval.
    pub fn evaluate(
        &self,
        category: &str,
        name: &str,
        primary_param: Option<&str>,
        requires_hitl_default: bool,
    ) -> Decision {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.matches(category, name, primary_param) {
                return Decision {
                    action: rule.action,
                    reason: rule.reason.clone(),
                    rule_index: Some(idx),
                };
            }
        }
        if requires_hitl_default {
            Decision::require_approval("Tool requires approval by default")
        } else {
            Decision::allow()
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.rules).unwrap_or(serde_json::json!([]))
    }
}

/// fnmatch-style glob: `*` matches any run of characters, `?` matches one.
/// Case-sensitive; no character classes. Iterative with backtracking so
/// pathological patterns cannot recurse deeply.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
