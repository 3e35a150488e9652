//! Plan tools: thin handlers over the in-memory plan executor.

use crate::error::ToolError;
use crate::plan::TaskSpec;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

fn default_on_failure() -> String {
    "stop".to_string()
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    name: String,
    #[serde(default = "default_on_failure")]
    on_failure: String,
    tasks: Vec<TaskSpec>,
}

async fn create(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: CreateRequest = parse(params)?;
    ctx.plans.create(&req.name, &req.on_failure, req.tasks)
}

#[derive(Debug, Deserialize)]
struct RefRequest {
    plan_id: String,
}

async fn execute(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: RefRequest = parse(params)?;
    ctx.plans.execute(&req.plan_id).await
}

async fn status(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: RefRequest = parse(params)?;
    ctx.plans.status(&req.plan_id)
}

async fn list(ctx: ToolContext, _params: Value) -> HandlerResult {
    Ok(ctx.plans.list())
}

async fn cancel(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: RefRequest = parse(params)?;
    ctx.plans.cancel(&req.plan_id)
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    let task_schema = json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "name": {"type": ["string", "null"]},
            "tool_category": {"type": "string"},
            "tool_name": {"type": "string"},
            "params": {"type": "object", "default": {}},
            "depends_on": {"type": "array", "items": {"type": "string"}, "default": []},
            "require_hitl": {"type": "boolean", "default": false},
            "on_failure": {
                "type": ["string", "null"],
                "enum": ["stop", "skip_dependents", "continue", null],
            },
        },
        "required": ["id", "tool_category", "tool_name"],
    });
    let ref_schema = json!({
        "type": "object",
        "properties": {"plan_id": {"type": "string", "description": "Plan id or unique plan name"}},
        "required": ["plan_id"],
    });
    vec![
        ToolDescriptor::new(
            "plan",
            "create",
            "Validate and register a task DAG. Rejects cycles, duplicate ids, and \
             unknown dependencies; returns the level-indexed execution order.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "on_failure": {
                        "type": "string",
                        "enum": ["stop", "skip_dependents", "continue"],
                        "default": "stop",
                    },
                    "tasks": {"type": "array", "items": task_schema, "minItems": 1},
                },
                "required": ["name", "tasks"],
            }),
            false,
            Some("name"),
            Arc::new(|ctx, params| Box::pin(create(ctx, params))),
        ),
        ToolDescriptor::new(
            "plan",
            "execute",
            "Execute a plan level by level; tasks within a level run concurrently. \
             Blocks until every task reaches a terminal status.",
            ref_schema.clone(),
            false,
            Some("plan_id"),
            Arc::new(|ctx, params| Box::pin(execute(ctx, params))),
        ),
        ToolDescriptor::new(
            "plan",
            "status",
            "Plan and per-task status with aggregate counts.",
            ref_schema.clone(),
            false,
            Some("plan_id"),
            Arc::new(|ctx, params| Box::pin(status(ctx, params))),
        ),
        ToolDescriptor::new(
            "plan",
            "list",
            "List all plans with summary information.",
            json!({"type": "object", "properties": {}}),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(list(ctx, params))),
        ),
        ToolDescriptor::new(
            "plan",
            "cancel",
            "Cancel a plan: pending and running tasks become skipped, the plan \
             becomes cancelled and cannot re-execute.",
            ref_schema,
            false,
            Some("plan_id"),
            Arc::new(|ctx, params| Box::pin(cancel(ctx, params))),
        ),
    ]
}
