//! Docker tools, backed by the `docker` CLI. Read-only operations (ps,
//! inspect, logs) are allowed by default; lifecycle actions require
//! approval.

use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const DOCKER_TIMEOUT: Duration = Duration::from_secs(60);
const ACTIONS: &[&str] = &["start", "stop", "restart", "pause", "unpause"];

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

async fn run_docker(args: &[&str]) -> Result<(String, String, i32), ToolError> {
    let out = tokio::time::timeout(
        DOCKER_TIMEOUT,
        tokio::process::Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ToolError::timeout("docker command timed out"))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::invalid("docker is not installed or not on PATH")
        } else {
            ToolError::internal(format!("failed to spawn docker: {e}"))
        }
    })?;
    Ok((
        String::from_utf8_lossy(&out.stdout).into_owned(),
        String::from_utf8_lossy(&out.stderr).into_owned(),
        out.status.code().unwrap_or(-1),
    ))
}

fn container_error(container: &str, stderr: &str) -> ToolError {
    if stderr.contains("No such container") {
        ToolError::not_found(format!("Container '{container}' not found"))
            .with_suggestion_tool("docker_ps".to_string())
    } else {
        ToolError::internal(format!("docker failed: {}", stderr.trim()))
    }
}

// ------------------------------------------------------------------
// docker.ps
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PsRequest {
    #[serde(default)]
    all: bool,
}

async fn ps(_ctx: ToolContext, params: Value) -> HandlerResult {
    let req: PsRequest = parse(params)?;
    let mut args = vec!["ps", "--format", "{{json .}}"];
    if req.all {
        args.push("--all");
    }
    let (stdout, stderr, code) = run_docker(&args).await?;
    if code != 0 {
        return Err(ToolError::internal(format!(
            "docker ps failed: {}",
            stderr.trim()
        )));
    }
    let containers: Vec<Value> = stdout
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let total = containers.len();
    Ok(json!({"containers": containers, "total": total}))
}

// ------------------------------------------------------------------
// docker.inspect
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InspectRequest {
    container: String,
}

async fn inspect(_ctx: ToolContext, params: Value) -> HandlerResult {
    let req: InspectRequest = parse(params)?;
    let (stdout, stderr, code) = run_docker(&["inspect", &req.container]).await?;
    if code != 0 {
        return Err(container_error(&req.container, &stderr));
    }
    let detail: Value = serde_json::from_str(&stdout)
        .map_err(|e| ToolError::internal(format!("unparseable docker inspect output: {e}")))?;
    let first = detail.get(0).cloned().unwrap_or(Value::Null);
    Ok(json!({"container": req.container, "detail": first}))
}

// ------------------------------------------------------------------
// docker.logs
// ------------------------------------------------------------------

fn default_tail() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
struct LogsRequest {
    container: String,
    #[serde(default = "default_tail")]
    tail: u64,
    #[serde(default)]
    since: Option<String>,
}

async fn logs(_ctx: ToolContext, params: Value) -> HandlerResult {
    let req: LogsRequest = parse(params)?;
    let tail = req.tail.clamp(1, 10_000).to_string();
    let mut args = vec!["logs", "--tail", tail.as_str()];
    if let Some(since) = &req.since {
        args.push("--since");
        args.push(since);
    }
    args.push(&req.container);
    let (stdout, stderr, code) = run_docker(&args).await?;
    if code != 0 {
        return Err(container_error(&req.container, &stderr));
    }
    // docker interleaves app output on both streams; keep them separate.
    Ok(json!({
        "container": req.container,
        "logs": stdout,
        "stderr_logs": stderr,
    }))
}

// ------------------------------------------------------------------
// docker.action
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ActionRequest {
    container: String,
    action: String,
    #[serde(default)]
    timeout: Option<u64>,
}

async fn action(_ctx: ToolContext, params: Value) -> HandlerResult {
    let req: ActionRequest = parse(params)?;
    if !ACTIONS.contains(&req.action.as_str()) {
        return Err(ToolError::invalid(format!(
            "Invalid action '{}'. Must be one of: {}",
            req.action,
            ACTIONS.join(", ")
        )));
    }
    let previous = container_state(&req.container).await?;
    let timeout_s;
    let mut args = vec![req.action.as_str()];
    if let (Some(t), "stop" | "restart") = (req.timeout, req.action.as_str()) {
        timeout_s = t.to_string();
        args.push("--time");
        args.push(&timeout_s);
    }
    args.push(&req.container);
    let (_stdout, stderr, code) = run_docker(&args).await?;
    if code != 0 {
        return Err(container_error(&req.container, &stderr));
    }
    let current = container_state(&req.container).await?;
    Ok(json!({
        "container": req.container,
        "action": req.action,
        "previous_status": previous,
        "status": current,
    }))
}

async fn container_state(container: &str) -> Result<String, ToolError> {
    let (stdout, stderr, code) =
        run_docker(&["inspect", "--format", "{{.State.Status}}", container]).await?;
    if code != 0 {
        return Err(container_error(container, &stderr));
    }
    Ok(stdout.trim().to_string())
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "docker",
            "ps",
            "List Docker containers (running by default, all with all=true).",
            json!({
                "type": "object",
                "properties": {"all": {"type": "boolean", "default": false}},
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(ps(ctx, params))),
        ),
        ToolDescriptor::new(
            "docker",
            "inspect",
            "Inspect a container: configuration, network settings, mounts, state.",
            json!({
                "type": "object",
                "properties": {"container": {"type": "string"}},
                "required": ["container"],
            }),
            false,
            Some("container"),
            Arc::new(|ctx, params| Box::pin(inspect(ctx, params))),
        ),
        ToolDescriptor::new(
            "docker",
            "logs",
            "Fetch container logs, bounded by tail and optional since timestamp.",
            json!({
                "type": "object",
                "properties": {
                    "container": {"type": "string"},
                    "tail": {"type": "integer", "default": 100, "minimum": 1},
                    "since": {"type": ["string", "null"]},
                },
                "required": ["container"],
            }),
            false,
            Some("container"),
            Arc::new(|ctx, params| Box::pin(logs(ctx, params))),
        ),
        ToolDescriptor::new(
            "docker",
            "action",
            "Control a container lifecycle: start, stop, restart, pause, unpause. \
             Requires approval by default.",
            json!({
                "type": "object",
                "properties": {
                    "container": {"type": "string"},
                    "action": {"type": "string", "enum": ACTIONS},
                    "timeout": {"type": ["integer", "null"], "minimum": 1},
                },
                "required": ["container", "action"],
            }),
            true,
            Some("container"),
            Arc::new(|ctx, params| Box::pin(action(ctx, params))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_are_validated() {
        let req: ActionRequest =
            serde_json::from_value(json!({"container": "web", "action": "stop"})).unwrap();
        assert!(ACTIONS.contains(&req.action.as_str()));
        let bad: ActionRequest =
            serde_json::from_value(json!({"container": "web", "action": "destroy"})).unwrap();
        assert!(!ACTIONS.contains(&bad.action.as_str()));
    }

    #[test]
    fn container_error_maps_missing_container() {
        let err = container_error("web", "Error: No such container: web");
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
        assert_eq!(err.suggestion_tool.as_deref(), Some("docker_ps"));
        let err = container_error("web", "permission denied on socket");
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::Internal);
    }
}
