//! Shell execution tool. Commands are parsed into argv form and spawned
//! directly (no shell interpolation), cwd pinned to the workspace. Commands
//! outside the safety allowlist, or containing shell metacharacters, are
//! escalated to the HITL gate rather than refused outright.

use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Commands runnable without approval when free of dangerous flags.
const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "whoami", "date", "which", "head", "tail", "grep", "find", "wc",
    "sort", "uniq", "diff", "tree", "file", "stat", "git", "python", "python3", "node", "npm",
    "pip", "pip3", "docker", "curl", "wget", "jq", "sed", "awk", "cut", "tr", "basename",
    "dirname",
];

const DANGEROUS_METACHARACTERS: &[char] = &[
    ';', '|', '&', '>', '<', '`', '$', '(', ')', '{', '}', '[', ']', '*', '?', '~', '!', '^',
    '\n', '\r',
];

const MAX_OUTPUT_BYTES: usize = 100_000;

/// Split a command line into argv words, honoring single and double quotes
/// and backslash escapes.
pub fn split_command(command: &str) -> Result<Vec<String>, ToolError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    match chars.next() {
                        Some(next) => current.push(next),
                        None => return Err(ToolError::invalid("Trailing backslash in command")),
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_word = true;
                    }
                    None => return Err(ToolError::invalid("Trailing backslash in command")),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ToolError::invalid("Unterminated quote in command"));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(ToolError::invalid("Command cannot be empty"));
    }
    Ok(words)
}

/// Reason a command needs approval, or `None` when it is safe to run
/// directly. Used as the descriptor's approval gate.
pub fn safety_reason(params: &Value) -> Option<String> {
    let Some(command) = params.get("command").and_then(|v| v.as_str()) else {
        return None;
    };
    for c in DANGEROUS_METACHARACTERS {
        if command.contains(*c) {
            return Some(format!("Contains dangerous metacharacter: '{c}'"));
        }
    }
    let words = match split_command(command) {
        Ok(w) => w,
        Err(e) => return Some(e.message),
    };
    let base = words[0].as_str();
    if !ALLOWED_COMMANDS.contains(&base) {
        return Some(format!("Command '{base}' not in allowlist"));
    }
    if base == "rm" && (command.contains("-rf") || command.contains("-fr")) {
        return Some("Recursive force delete requires approval".to_string());
    }
    if matches!(base, "curl" | "wget") {
        for flag in ["-o", "--output", "-O"] {
            if words[1..].iter().any(|w| w == flag) {
                return Some(format!("Output redirection with {flag} requires approval"));
            }
        }
    }
    None
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn truncate_output(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let total = s.len();
        let mut end = MAX_OUTPUT_BYTES;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str(&format!("\n\n[Output truncated: {total} bytes total]"));
    }
    s
}

async fn execute(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: ExecuteRequest = parse(params)?;
    let started = Instant::now();

    let working_dir = match &req.cwd {
        Some(cwd) => {
            let dir = ctx.workspace.resolve(cwd)?;
            if !dir.is_dir() {
                return Err(ToolError::invalid(format!(
                    "Working directory does not exist: {cwd}"
                )));
            }
            dir
        }
        None => ctx.workspace.root().to_path_buf(),
    };

    let words = split_command(&req.command)?;
    let (program, args) = words.split_first().expect("non-empty argv");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(&working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(env) = &req.env {
        for (k, v) in env {
            cmd.env(k, v);
        }
    }

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::invalid(format!(
                "Command not found: '{program}'. Make sure it is installed and on PATH."
            ))
        } else if e.kind() == std::io::ErrorKind::PermissionDenied {
            ToolError::security(format!("Permission denied executing command: '{program}'"))
        } else {
            ToolError::internal(format!("Failed to execute command: {e}"))
        }
    })?;

    let timeout = Duration::from_secs(req.timeout.clamp(1, 600));
    let output = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            return Err(ToolError::internal("Command cancelled"));
        }
        out = tokio::time::timeout(timeout, child.wait_with_output()) => match out {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::internal(format!("Command failed: {e}"))),
            Err(_) => {
                return Err(ToolError::timeout(format!(
                    "Command timed out after {} seconds. Consider increasing the timeout parameter.",
                    req.timeout
                )))
            }
        },
    };

    let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).into_owned());
    let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).into_owned());
    let exit_code = output.status.code().unwrap_or(-1);
    let duration_ms = started.elapsed().as_millis() as i64;
    info!(command = %req.command, exit_code, duration_ms, "shell command executed");

    Ok(json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": exit_code,
        "duration_ms": duration_ms,
        "command": req.command,
        "working_directory": working_dir.to_string_lossy(),
    }))
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor::new(
        "shell",
        "execute",
        "Execute a shell command in the workspace (argv spawn, no shell interpolation). \
         Commands outside the safety allowlist require approval.",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "cwd": {"type": ["string", "null"]},
                "env": {"type": ["object", "null"], "additionalProperties": {"type": "string"}},
                "timeout": {"type": "integer", "default": 30, "minimum": 1, "maximum": 600},
            },
            "required": ["command"],
        }),
        false,
        Some("command"),
        Arc::new(|ctx, params| Box::pin(execute(ctx, params))),
    )
    .with_approval_gate(safety_reason)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[test]
    fn split_honors_quotes_and_escapes() {
        assert_eq!(
            split_command("echo 'hello world' two").unwrap(),
            vec!["echo", "hello world", "two"]
        );
        assert_eq!(
            split_command("grep \"a b\" file.txt").unwrap(),
            vec!["grep", "a b", "file.txt"]
        );
        assert_eq!(split_command("echo a\\ b").unwrap(), vec!["echo", "a b"]);
        assert!(split_command("echo 'unterminated").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn safety_gate_flags_unsafe_commands() {
        assert!(safety_reason(&json!({"command": "ls -la"})).is_none());
        assert!(safety_reason(&json!({"command": "cat notes.txt"})).is_none());
        // Metacharacters.
        assert!(safety_reason(&json!({"command": "ls; rm x"})).is_some());
        assert!(safety_reason(&json!({"command": "echo $HOME"})).is_some());
        // Not on the allowlist.
        assert!(safety_reason(&json!({"command": "rm x"})).is_some());
        assert!(safety_reason(&json!({"command": "chmod 777 x"})).is_some());
        // Download-to-disk flags.
        assert!(safety_reason(&json!({"command": "curl -o out http://e.com"})).is_some());
        assert!(safety_reason(&json!({"command": "curl http://e.com"})).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executes_in_workspace_cwd() {
        let (ctx, _guard) = context().await;
        let out = execute(ctx.clone(), json!({"command": "pwd"})).await.unwrap();
        assert_eq!(out["exit_code"], 0);
        let stdout = out["stdout"].as_str().unwrap().trim();
        assert_eq!(stdout, ctx.workspace.root().to_string_lossy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let (ctx, _guard) = context().await;
        let out = execute(ctx, json!({"command": "ls /definitely/not/here"}))
            .await
            .unwrap();
        assert_ne!(out["exit_code"], 0);
        assert!(!out["stderr"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_invalid_parameter() {
        let (ctx, _guard) = context().await;
        let err = execute(ctx, json!({"command": "no-such-binary-zzz"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::InvalidParameter);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let (ctx, _guard) = context().await;
        let err = execute(ctx, json!({"command": "sleep 5", "timeout": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::Timeout);
    }
}
