//! The tool registry: `(category, name)` → descriptor. Built once at startup
//! by the composition root; immutable afterwards. Descriptors carry a JSON
//! input schema (compiled eagerly so a typo fails at boot, not per request)
//! and a boxed async handler.

use crate::config::HttpConfig;
use crate::error::ToolError;
use crate::plan::PlanService;
use crate::secrets::SecretStore;
use crate::workspace::WorkspaceResolver;
use futures::future::BoxFuture;
use hostbridge_kernel::Kernel;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler body may touch. Cheap to clone; built per call by
/// the dispatch engine with the invocation's cancellation token.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<WorkspaceResolver>,
    pub secrets: Arc<SecretStore>,
    pub kernel: Kernel,
    pub http: Arc<HttpConfig>,
    pub plans: Arc<PlanService>,
    pub registry: Arc<ToolRegistry>,
    pub cancel: CancellationToken,
}

pub type HandlerResult = Result<Value, ToolError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type Handler = Arc<dyn Fn(ToolContext, Value) -> HandlerFuture + Send + Sync>;

pub struct ToolDescriptor {
    pub category: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub requires_hitl_default: bool,
    /// The parameter policy glob patterns apply to (`path`, `command`, ...).
    pub primary_param: Option<&'static str>,
    /// Content-based gate consulted when policy would allow: returning
    /// `Some(reason)` forces approval (shell commands outside the safety
    /// allowlist use this).
    pub approval_gate: Option<fn(&Value) -> Option<String>>,
    compiled: JSONSchema,
    pub handler: Handler,
}

impl ToolDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        category: &str,
        name: &str,
        description: &str,
        input_schema: Value,
        requires_hitl_default: bool,
        primary_param: Option<&'static str>,
        handler: Handler,
    ) -> Self {
        let compiled = JSONSchema::compile(&input_schema)
            .unwrap_or_else(|e| panic!("invalid input schema for {category}.{name}: {e}"));
        Self {
            category: category.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            output_schema: None,
            requires_hitl_default,
            primary_param,
            approval_gate: None,
            compiled,
            handler,
        }
    }

    pub fn with_approval_gate(mut self, gate: fn(&Value) -> Option<String>) -> Self {
        self.approval_gate = Some(gate);
        self
    }

    /// The tool name exposed over MCP.
    pub fn mcp_name(&self) -> String {
        format!("{}_{}", self.category, self.name)
    }

    /// Validate resolved params against the input schema.
    pub fn validate(&self, params: &Value) -> Result<(), ToolError> {
        if let Err(mut errors) = self.compiled.validate(params) {
            let first = errors
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "schema validation failed".to_string());
            return Err(ToolError::schema(format!(
                "Invalid parameters for {}_{}: {first}",
                self.category, self.name
            )));
        }
        Ok(())
    }

    /// The string value of the primary param, for policy pattern matching.
    pub fn primary_param_value<'p>(&self, params: &'p Value) -> Option<&'p str> {
        self.primary_param
            .and_then(|key| params.get(key))
            .and_then(|v| v.as_str())
    }
}

pub struct ToolRegistry {
    tools: BTreeMap<(String, String), Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Self {
        let mut tools = BTreeMap::new();
        for desc in descriptors {
            let key = (desc.category.clone(), desc.name.clone());
            let prior = tools.insert(key, Arc::new(desc));
            if let Some(prior) = prior {
                panic!(
                    "duplicate tool registration: {}.{}",
                    prior.category, prior.name
                );
            }
        }
        Self { tools }
    }

    pub fn get(&self, category: &str, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools
            .get(&(category.to_string(), name.to_string()))
            .cloned()
    }

    /// Resolve an MCP-form name (`{category}_{name}`). Categories never
    /// contain underscores, so the first one is the separator.
    pub fn get_mcp(&self, mcp_name: &str) -> Option<Arc<ToolDescriptor>> {
        let (category, name) = mcp_name.split_once('_')?;
        self.get(category, name)
    }

    pub fn list(&self) -> Vec<Arc<ToolDescriptor>> {
        self.tools.values().cloned().collect()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .tools
            .keys()
            .map(|(c, _)| c.clone())
            .collect();
        cats.dedup();
        cats
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
