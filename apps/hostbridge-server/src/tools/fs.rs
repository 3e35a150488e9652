//! Filesystem tools. Every path goes through the workspace resolver; the
//! handlers below only ever see validated absolute paths.

use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use walkdir::WalkDir;

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

fn check_encoding(encoding: &str) -> Result<(), ToolError> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Ok(()),
        other => Err(ToolError::invalid(format!(
            "Unsupported encoding '{other}'. Only utf-8 is supported."
        ))),
    }
}

// ------------------------------------------------------------------
// fs.read
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReadRequest {
    path: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default)]
    max_lines: Option<usize>,
    #[serde(default)]
    line_start: Option<usize>,
    #[serde(default)]
    line_end: Option<usize>,
}

async fn read(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: ReadRequest = parse(params)?;
    check_encoding(&req.encoding)?;
    let resolved = ctx.workspace.resolve(&req.path)?;
    let meta = tokio::fs::metadata(&resolved).await.map_err(|_| {
        ToolError::not_found(format!(
            "File not found: {}. Use fs_list to see available files.",
            req.path
        ))
        .with_suggestion_tool("fs_list".to_string())
    })?;
    if meta.is_dir() {
        return Err(ToolError::invalid(format!(
            "Path is not a file: {}. Use fs_list to list directory contents.",
            req.path
        ))
        .with_suggestion_tool("fs_list".to_string()));
    }
    let size_bytes = meta.len();
    let raw = tokio::fs::read(&resolved)
        .await
        .map_err(|e| ToolError::internal(format!("Failed to read file: {e}")))?;
    let text = String::from_utf8_lossy(&raw).into_owned();
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let line_count = lines.len();

    let mut window: Vec<&str> = lines;
    if req.line_start.is_some() || req.line_end.is_some() {
        let start = req.line_start.unwrap_or(1);
        let end = req.line_end.unwrap_or(line_count);
        if start < 1 || (line_count > 0 && start > line_count) {
            return Err(ToolError::invalid(format!(
                "line_start {start} is out of range. File has {line_count} lines."
            )));
        }
        if end < start {
            return Err(ToolError::invalid(format!(
                "line_end {end} is before line_start {start}"
            )));
        }
        window = window
            .into_iter()
            .skip(start - 1)
            .take(end - start + 1)
            .collect();
    }
    if let Some(max) = req.max_lines {
        window.truncate(max);
    }

    Ok(json!({
        "content": window.concat(),
        "path": resolved.to_string_lossy(),
        "size_bytes": size_bytes,
        "line_count": line_count,
        "encoding": req.encoding,
    }))
}

// ------------------------------------------------------------------
// fs.write
// ------------------------------------------------------------------

fn default_mode() -> String {
    "create".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    /// Strings write as-is; numbers and booleans write their string form so
    /// type-preserving task references land usable on disk.
    content: Value,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_true")]
    create_dirs: bool,
    #[serde(default = "default_encoding")]
    encoding: String,
}

fn content_text(content: &Value) -> Result<String, ToolError> {
    match content {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ToolError::invalid(format!(
            "content must be a string, number, or boolean; got {other}"
        ))),
    }
}

async fn write(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: WriteRequest = parse(params)?;
    check_encoding(&req.encoding)?;
    let content = content_text(&req.content)?;
    let resolved = ctx.workspace.resolve(&req.path)?;
    let existed = tokio::fs::try_exists(&resolved).await.unwrap_or(false);

    match req.mode.as_str() {
        "create" => {
            if existed {
                return Err(ToolError::invalid(format!(
                    "File already exists: {}. Use mode 'overwrite' or 'append'.",
                    req.path
                )));
            }
        }
        "overwrite" | "append" => {}
        other => {
            return Err(ToolError::invalid(format!(
                "Invalid mode '{other}'. Must be 'create', 'overwrite', or 'append'."
            )))
        }
    }

    if req.create_dirs {
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::internal(format!("Failed to create parent dirs: {e}")))?;
        }
    }

    let bytes = content.as_bytes();
    if req.mode == "append" {
        use tokio::io::AsyncWriteExt as _;
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .await
            .map_err(|e| ToolError::internal(format!("Failed to open file: {e}")))?;
        f.write_all(bytes)
            .await
            .map_err(|e| ToolError::internal(format!("Failed to write file: {e}")))?;
    } else {
        tokio::fs::write(&resolved, bytes)
            .await
            .map_err(|e| ToolError::internal(format!("Failed to write file: {e}")))?;
    }

    Ok(json!({
        "path": resolved.to_string_lossy(),
        "bytes_written": bytes.len(),
        "created": !existed,
        "mode": req.mode,
    }))
}

// ------------------------------------------------------------------
// fs.list
// ------------------------------------------------------------------

fn default_list_path() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize)]
struct ListRequest {
    #[serde(default = "default_list_path")]
    path: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    max_depth: Option<usize>,
}

async fn list(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: ListRequest = parse(params)?;
    let resolved = ctx.workspace.resolve(&req.path)?;
    if !resolved.is_dir() {
        return Err(ToolError::not_found(format!(
            "Directory not found: {}",
            req.path
        ))
        .with_suggestion_tool("workspace_info".to_string()));
    }
    let root = resolved.clone();
    let pattern = req.pattern.clone();
    let depth = if req.recursive {
        req.max_depth.unwrap_or(16)
    } else {
        1
    };
    let entries = tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(pat) = &pattern {
                if !hostbridge_policy::glob_match(pat, &name) {
                    continue;
                }
            }
            let meta = entry.metadata().ok();
            let modified = meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
            entries.push(json!({
                "name": name,
                "path": entry.path().strip_prefix(&root).unwrap_or(entry.path()).to_string_lossy(),
                "type": if entry.file_type().is_dir() { "directory" } else { "file" },
                "size_bytes": meta.map(|m| m.len()).unwrap_or(0),
                "modified": modified,
            }));
        }
        entries
    })
    .await
    .map_err(|e| ToolError::internal(format!("listing task failed: {e}")))?;

    let total = entries.len();
    Ok(json!({
        "path": resolved.to_string_lossy(),
        "entries": entries,
        "total": total,
    }))
}

// ------------------------------------------------------------------
// fs.search
// ------------------------------------------------------------------

fn default_max_results() -> usize {
    100
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_list_path")]
    path: String,
    #[serde(default)]
    regex: bool,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

async fn search(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: SearchRequest = parse(params)?;
    if req.query.is_empty() {
        return Err(ToolError::invalid("Search query cannot be empty"));
    }
    let resolved = ctx.workspace.resolve(&req.path)?;
    let matcher = if req.regex {
        let pattern = if req.case_sensitive {
            req.query.clone()
        } else {
            format!("(?i){}", req.query)
        };
        Some(Regex::new(&pattern).map_err(|e| ToolError::invalid(format!("Invalid regex: {e}")))?)
    } else {
        None
    };
    let query = if req.case_sensitive {
        req.query.clone()
    } else {
        req.query.to_lowercase()
    };
    let case_sensitive = req.case_sensitive;
    let max_results = req.max_results.clamp(1, 1000);

    let matches = tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        'files: for entry in WalkDir::new(&resolved)
            .max_depth(32)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Ok(raw) = std::fs::read(entry.path()) else {
                continue;
            };
            // Skip binary-looking files.
            if raw.iter().take(1024).any(|b| *b == 0) {
                continue;
            }
            let text = String::from_utf8_lossy(&raw);
            for (idx, line) in text.lines().enumerate() {
                let hit = match &matcher {
                    Some(re) => re.is_match(line),
                    None => {
                        if case_sensitive {
                            line.contains(&query)
                        } else {
                            line.to_lowercase().contains(&query)
                        }
                    }
                };
                if hit {
                    matches.push(json!({
                        "file": entry.path().strip_prefix(&resolved).unwrap_or(entry.path()).to_string_lossy(),
                        "line_number": idx + 1,
                        "line": line.chars().take(400).collect::<String>(),
                    }));
                    if matches.len() >= max_results {
                        break 'files;
                    }
                }
            }
        }
        matches
    })
    .await
    .map_err(|e| ToolError::internal(format!("search task failed: {e}")))?;

    let total = matches.len();
    Ok(json!({
        "matches": matches,
        "total": total,
        "truncated": total >= max_results,
    }))
}

// ------------------------------------------------------------------
// Descriptors
// ------------------------------------------------------------------

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "fs",
            "read",
            "Read the contents of a file at the specified path, relative to the workspace. \
             Supports line windows for large files.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to workspace"},
                    "encoding": {"type": "string", "default": "utf-8"},
                    "max_lines": {"type": ["integer", "null"], "minimum": 1},
                    "line_start": {"type": ["integer", "null"], "minimum": 1},
                    "line_end": {"type": ["integer", "null"], "minimum": 1},
                },
                "required": ["path"],
            }),
            false,
            Some("path"),
            Arc::new(|ctx, params| Box::pin(read(ctx, params))),
        ),
        ToolDescriptor::new(
            "fs",
            "write",
            "Write content to a file in the workspace. Modes: create (fails if the file \
             exists), overwrite, append.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": ["string", "number", "boolean"]},
                    "mode": {"type": "string", "enum": ["create", "overwrite", "append"], "default": "create"},
                    "create_dirs": {"type": "boolean", "default": true},
                    "encoding": {"type": "string", "default": "utf-8"},
                },
                "required": ["path", "content"],
            }),
            false,
            Some("path"),
            Arc::new(|ctx, params| Box::pin(write(ctx, params))),
        ),
        ToolDescriptor::new(
            "fs",
            "list",
            "List directory contents with entry type, size, and modification time. \
             Optionally recursive with a glob filter on entry names.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "default": "."},
                    "recursive": {"type": "boolean", "default": false},
                    "pattern": {"type": ["string", "null"]},
                    "max_depth": {"type": ["integer", "null"], "minimum": 1},
                },
            }),
            false,
            Some("path"),
            Arc::new(|ctx, params| Box::pin(list(ctx, params))),
        ),
        ToolDescriptor::new(
            "fs",
            "search",
            "Search file contents under a workspace subtree by substring or regex. \
             Binary files are skipped; results are bounded by max_results.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "path": {"type": "string", "default": "."},
                    "regex": {"type": "boolean", "default": false},
                    "case_sensitive": {"type": "boolean", "default": false},
                    "max_results": {"type": "integer", "default": 100, "minimum": 1},
                },
                "required": ["query"],
            }),
            false,
            Some("path"),
            Arc::new(|ctx, params| Box::pin(search(ctx, params))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (ctx, _guard) = context().await;
        let out = write(
            ctx.clone(),
            json!({"path": "notes/hello.txt", "content": "line1\nline2\n"}),
        )
        .await
        .unwrap();
        assert_eq!(out["bytes_written"], 12);
        assert_eq!(out["created"], true);

        let out = read(ctx, json!({"path": "notes/hello.txt"})).await.unwrap();
        assert_eq!(out["content"], "line1\nline2\n");
        assert_eq!(out["line_count"], 2);
    }

    #[tokio::test]
    async fn create_mode_refuses_existing_file() {
        let (ctx, _guard) = context().await;
        write(ctx.clone(), json!({"path": "a.txt", "content": "x"}))
            .await
            .unwrap();
        let err = write(ctx.clone(), json!({"path": "a.txt", "content": "y"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::InvalidParameter);

        let out = write(
            ctx.clone(),
            json!({"path": "a.txt", "content": "y", "mode": "overwrite"}),
        )
        .await
        .unwrap();
        assert_eq!(out["created"], false);
        let out = write(
            ctx.clone(),
            json!({"path": "a.txt", "content": "z", "mode": "append"}),
        )
        .await
        .unwrap();
        assert_eq!(out["mode"], "append");
        let out = read(ctx, json!({"path": "a.txt"})).await.unwrap();
        assert_eq!(out["content"], "yz");
    }

    #[tokio::test]
    async fn read_missing_file_suggests_fs_list() {
        let (ctx, _guard) = context().await;
        let err = read(ctx, json!({"path": "ghost.txt"})).await.unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
        assert_eq!(err.suggestion_tool.as_deref(), Some("fs_list"));
    }

    #[tokio::test]
    async fn traversal_fails_security() {
        let (ctx, _guard) = context().await;
        let err = write(ctx, json!({"path": "../x", "content": "no"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::Security);
    }

    #[tokio::test]
    async fn line_window_selects_requested_range() {
        let (ctx, _guard) = context().await;
        write(
            ctx.clone(),
            json!({"path": "n.txt", "content": "a\nb\nc\nd\n"}),
        )
        .await
        .unwrap();
        let out = read(ctx, json!({"path": "n.txt", "line_start": 2, "line_end": 3}))
            .await
            .unwrap();
        assert_eq!(out["content"], "b\nc\n");
        assert_eq!(out["line_count"], 4);
    }

    #[tokio::test]
    async fn list_and_search() {
        let (ctx, _guard) = context().await;
        write(ctx.clone(), json!({"path": "src/one.rs", "content": "fn main() {}\n"}))
            .await
            .unwrap();
        write(ctx.clone(), json!({"path": "src/two.txt", "content": "hello needle\n"}))
            .await
            .unwrap();

        let out = list(ctx.clone(), json!({"path": "src"})).await.unwrap();
        assert_eq!(out["total"], 2);

        let out = list(
            ctx.clone(),
            json!({"path": ".", "recursive": true, "pattern": "*.rs"}),
        )
        .await
        .unwrap();
        assert_eq!(out["total"], 1);
        assert_eq!(out["entries"][0]["name"], "one.rs");

        let out = search(ctx, json!({"query": "NEEDLE", "path": "."}))
            .await
            .unwrap();
        assert_eq!(out["total"], 1);
        assert_eq!(out["matches"][0]["line_number"], 1);
    }
}
