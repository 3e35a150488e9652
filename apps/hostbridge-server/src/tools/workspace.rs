//! Workspace introspection tools: root info and secret key listing. Secret
//! values never appear in any response.

use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use serde_json::{json, Value};
use std::sync::Arc;

async fn info(ctx: ToolContext, _params: Value) -> HandlerResult {
    let root = ctx.workspace.root().to_path_buf();
    let entries = tokio::task::spawn_blocking(move || {
        std::fs::read_dir(&root).map(|rd| rd.count()).unwrap_or(0)
    })
    .await
    .unwrap_or(0);
    Ok(json!({
        "default_workspace": ctx.workspace.root().to_string_lossy(),
        "top_level_entries": entries,
        "tool_categories": ctx.registry.categories(),
        "secret_count": ctx.secrets.count(),
    }))
}

async fn secrets_list(ctx: ToolContext, _params: Value) -> HandlerResult {
    let keys = ctx.secrets.list_keys();
    let total = keys.len();
    Ok(json!({"keys": keys, "total": total}))
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            "workspace",
            "info",
            "Describe the workspace: root directory, available tool categories, \
             and the number of configured secrets.",
            json!({"type": "object", "properties": {}}),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(info(ctx, params))),
        ),
        ToolDescriptor::new(
            "workspace",
            "secrets_list",
            "List configured secret key names. Values are never returned.",
            json!({"type": "object", "properties": {}}),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(secrets_list(ctx, params))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    #[tokio::test]
    async fn info_reports_categories_and_secret_count() {
        let (ctx, _guard) = context().await;
        let out = info(ctx.clone(), json!({})).await.unwrap();
        assert_eq!(out["secret_count"], 1);
        assert!(out["tool_categories"].is_array());
        assert_eq!(
            out["default_workspace"],
            &*ctx.workspace.root().to_string_lossy()
        );
    }

    #[tokio::test]
    async fn secrets_list_returns_names_only() {
        let (ctx, _guard) = context().await;
        let out = secrets_list(ctx, json!({})).await.unwrap();
        assert_eq!(out["keys"], json!(["API_KEY"]));
        assert!(out.to_string().find("sekret").is_none());
    }
}
