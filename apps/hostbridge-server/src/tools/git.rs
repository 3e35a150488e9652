//! Git tools, backed by the `git` CLI running inside the workspace. Repo
//! paths resolve through the workspace resolver like any other path.

use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

fn default_repo() -> String {
    ".".to_string()
}

async fn run_git(repo: &Path, args: &[&str]) -> Result<(String, String, i32), ToolError> {
    let out = tokio::time::timeout(
        GIT_TIMEOUT,
        tokio::process::Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ToolError::timeout("git command timed out"))?
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::invalid("git is not installed or not on PATH")
        } else {
            ToolError::internal(format!("failed to spawn git: {e}"))
        }
    })?;
    Ok((
        String::from_utf8_lossy(&out.stdout).into_owned(),
        String::from_utf8_lossy(&out.stderr).into_owned(),
        out.status.code().unwrap_or(-1),
    ))
}

fn git_failed(op: &str, stderr: &str) -> ToolError {
    let detail = stderr.trim();
    if detail.contains("not a git repository") {
        ToolError::invalid("Not a git repository. Run git init first or point 'repo' at a repository.")
            .with_suggestion_tool("fs_list".to_string())
    } else {
        ToolError::internal(format!("git {op} failed: {detail}"))
    }
}

// ------------------------------------------------------------------
// git.status
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusRequest {
    #[serde(default = "default_repo")]
    repo: String,
}

async fn status(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: StatusRequest = parse(params)?;
    let repo = ctx.workspace.resolve(&req.repo)?;
    let (stdout, stderr, code) = run_git(&repo, &["status", "--porcelain=v1", "--branch"]).await?;
    if code != 0 {
        return Err(git_failed("status", &stderr));
    }
    let mut branch = String::new();
    let mut staged = Vec::new();
    let mut unstaged = Vec::new();
    let mut untracked = Vec::new();
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("## ") {
            branch = rest.split("...").next().unwrap_or(rest).to_string();
            continue;
        }
        if line.len() < 4 {
            continue;
        }
        let (index, worktree) = (line.as_bytes()[0] as char, line.as_bytes()[1] as char);
        let path = line[3..].to_string();
        if index == '?' {
            untracked.push(path);
        } else {
            if index != ' ' {
                staged.push(path.clone());
            }
            if worktree != ' ' {
                unstaged.push(path);
            }
        }
    }
    let clean = staged.is_empty() && unstaged.is_empty() && untracked.is_empty();
    Ok(json!({
        "branch": branch,
        "staged": staged,
        "unstaged": unstaged,
        "untracked": untracked,
        "clean": clean,
    }))
}

// ------------------------------------------------------------------
// git.log
// ------------------------------------------------------------------

fn default_log_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    #[serde(default = "default_repo")]
    repo: String,
    #[serde(default = "default_log_limit")]
    limit: usize,
    #[serde(default)]
    branch: Option<String>,
}

async fn log(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: LogRequest = parse(params)?;
    let repo = ctx.workspace.resolve(&req.repo)?;
    let limit = req.limit.clamp(1, 500).to_string();
    let mut args = vec![
        "log",
        "-n",
        &limit,
        "--pretty=format:%H%x1f%an%x1f%aI%x1f%s",
    ];
    if let Some(branch) = &req.branch {
        args.push(branch);
    }
    let (stdout, stderr, code) = run_git(&repo, &args).await?;
    if code != 0 {
        return Err(git_failed("log", &stderr));
    }
    let commits: Vec<Value> = stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\x1f');
            Some(json!({
                "hash": parts.next()?,
                "author": parts.next()?,
                "date": parts.next()?,
                "message": parts.next()?,
            }))
        })
        .collect();
    let total = commits.len();
    Ok(json!({"commits": commits, "total": total}))
}

// ------------------------------------------------------------------
// git.diff
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DiffRequest {
    #[serde(default = "default_repo")]
    repo: String,
    #[serde(default)]
    staged: bool,
    #[serde(default)]
    path: Option<String>,
}

async fn diff(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: DiffRequest = parse(params)?;
    let repo = ctx.workspace.resolve(&req.repo)?;
    let mut args = vec!["diff"];
    if req.staged {
        args.push("--cached");
    }
    if let Some(path) = &req.path {
        args.push("--");
        args.push(path);
    }
    let (stdout, stderr, code) = run_git(&repo, &args).await?;
    if code != 0 {
        return Err(git_failed("diff", &stderr));
    }
    Ok(json!({
        "diff": stdout,
        "staged": req.staged,
        "is_empty": stdout.trim().is_empty(),
    }))
}

// ------------------------------------------------------------------
// git.commit
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommitRequest {
    message: String,
    #[serde(default = "default_repo")]
    repo: String,
    /// Paths to stage; empty stages everything.
    #[serde(default)]
    files: Vec<String>,
}

async fn commit(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: CommitRequest = parse(params)?;
    if req.message.trim().is_empty() {
        return Err(ToolError::invalid("Commit message cannot be empty"));
    }
    let repo = ctx.workspace.resolve(&req.repo)?;

    let add_args: Vec<&str> = if req.files.is_empty() {
        vec!["add", "-A"]
    } else {
        let mut args = vec!["add", "--"];
        args.extend(req.files.iter().map(String::as_str));
        args
    };
    let (_stdout, stderr, code) = run_git(&repo, &add_args).await?;
    if code != 0 {
        return Err(git_failed("add", &stderr));
    }

    let (stdout, stderr, code) = run_git(&repo, &["commit", "-m", &req.message]).await?;
    if code != 0 {
        let combined = format!("{stderr}\n{stdout}");
        if combined.contains("nothing to commit") {
            return Err(ToolError::invalid("Nothing to commit: working tree clean"));
        }
        return Err(git_failed("commit", &combined));
    }

    let (hash, _, _) = run_git(&repo, &["rev-parse", "HEAD"]).await?;
    Ok(json!({
        "commit": hash.trim(),
        "message": req.message,
        "summary": stdout.trim(),
    }))
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "git",
            "status",
            "Show working tree status: branch, staged, unstaged, and untracked files.",
            json!({
                "type": "object",
                "properties": {"repo": {"type": "string", "default": "."}},
            }),
            false,
            Some("repo"),
            Arc::new(|ctx, params| Box::pin(status(ctx, params))),
        ),
        ToolDescriptor::new(
            "git",
            "log",
            "List recent commits with hash, author, date, and subject.",
            json!({
                "type": "object",
                "properties": {
                    "repo": {"type": "string", "default": "."},
                    "limit": {"type": "integer", "default": 20, "minimum": 1, "maximum": 500},
                    "branch": {"type": ["string", "null"]},
                },
            }),
            false,
            Some("repo"),
            Arc::new(|ctx, params| Box::pin(log(ctx, params))),
        ),
        ToolDescriptor::new(
            "git",
            "diff",
            "Show the working tree diff, optionally staged-only or limited to one path.",
            json!({
                "type": "object",
                "properties": {
                    "repo": {"type": "string", "default": "."},
                    "staged": {"type": "boolean", "default": false},
                    "path": {"type": ["string", "null"]},
                },
            }),
            false,
            Some("repo"),
            Arc::new(|ctx, params| Box::pin(diff(ctx, params))),
        ),
        ToolDescriptor::new(
            "git",
            "commit",
            "Stage files (all by default) and create a commit. Requires approval by default.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "repo": {"type": "string", "default": "."},
                    "files": {"type": "array", "items": {"type": "string"}, "default": []},
                },
                "required": ["message"],
            }),
            true,
            Some("repo"),
            Arc::new(|ctx, params| Box::pin(commit(ctx, params))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    async fn init_repo(ctx: &ToolContext) {
        let root = ctx.workspace.root().to_path_buf();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let out = tokio::process::Command::new("git")
                .arg("-C")
                .arg(&root)
                .args(&args)
                .output()
                .await
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        }
    }

    #[tokio::test]
    async fn status_commit_log_cycle() {
        let (ctx, _guard) = context().await;
        init_repo(&ctx).await;
        std::fs::write(ctx.workspace.root().join("file.txt"), "hello\n").unwrap();

        let out = status(ctx.clone(), json!({})).await.unwrap();
        assert_eq!(out["clean"], false);
        assert_eq!(out["untracked"][0], "file.txt");

        let out = commit(ctx.clone(), json!({"message": "add file"})).await.unwrap();
        assert!(!out["commit"].as_str().unwrap().is_empty());

        let out = status(ctx.clone(), json!({})).await.unwrap();
        assert_eq!(out["clean"], true);

        let out = log(ctx.clone(), json!({})).await.unwrap();
        assert_eq!(out["total"], 1);
        assert_eq!(out["commits"][0]["message"], "add file");

        let err = commit(ctx, json!({"message": "empty"})).await.unwrap_err();
        assert!(err.message.contains("Nothing to commit"));
    }

    #[tokio::test]
    async fn diff_reports_changes() {
        let (ctx, _guard) = context().await;
        init_repo(&ctx).await;
        std::fs::write(ctx.workspace.root().join("file.txt"), "one\n").unwrap();
        commit(ctx.clone(), json!({"message": "one"})).await.unwrap();
        std::fs::write(ctx.workspace.root().join("file.txt"), "two\n").unwrap();

        let out = diff(ctx, json!({})).await.unwrap();
        assert_eq!(out["is_empty"], false);
        assert!(out["diff"].as_str().unwrap().contains("-one"));
    }

    #[tokio::test]
    async fn non_repo_is_invalid_parameter() {
        let (ctx, _guard) = context().await;
        let err = status(ctx, json!({})).await.unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::InvalidParameter);
    }
}
