//! Memory graph tools: thin handlers over the kernel's graph wrappers.
//! Unknown node ids surface as `not_found` with `memory_search` suggested.

use crate::error::ToolError;
use crate::registry::{HandlerResult, ToolContext, ToolDescriptor};
use hostbridge_graph::{
    EdgeUpsert, NodeInsert, NodePatch, SearchArgs, SearchMode, DEFAULT_TRAVERSAL_DEPTH,
    ENTITY_TYPES, PARENT_OF,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::invalid(e.to_string()))
}

fn node_not_found(id: &str) -> ToolError {
    ToolError::not_found(format!("Node '{id}' not found"))
        .with_suggestion_tool("memory_search".to_string())
}

async fn assert_exists(ctx: &ToolContext, id: &str) -> Result<(), ToolError> {
    if ctx.kernel.node_exists_async(id.to_string()).await? {
        Ok(())
    } else {
        Err(node_not_found(id))
    }
}

// ------------------------------------------------------------------
// memory.store
// ------------------------------------------------------------------

fn default_entity_type() -> String {
    "note".to_string()
}

#[derive(Debug, Deserialize)]
struct RelationSpec {
    target_id: String,
    relation: String,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct StoreRequest {
    content: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_entity_type")]
    entity_type: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    relations: Vec<RelationSpec>,
}

async fn store(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: StoreRequest = parse(params)?;
    if !ENTITY_TYPES.contains(&req.entity_type.as_str()) {
        return Err(ToolError::invalid(format!(
            "Invalid entity_type '{}'. Must be one of: {}",
            req.entity_type,
            ENTITY_TYPES.join(", ")
        )));
    }
    // Relation targets must exist before the node is written.
    for rel in &req.relations {
        if !ctx.kernel.node_exists_async(rel.target_id.clone()).await? {
            return Err(ToolError::not_found(format!(
                "Relation target node '{}' does not exist",
                rel.target_id
            ))
            .with_suggestion_tool("memory_search".to_string()));
        }
    }
    let stored = ctx
        .kernel
        .insert_node_async(NodeInsert {
            name: req.name,
            content: req.content,
            entity_type: req.entity_type,
            tags: req.tags,
            metadata: req.metadata.unwrap_or_else(|| json!({})),
            source: req.source,
        })
        .await?;
    let node_id = stored["id"].as_str().unwrap_or_default().to_string();
    let mut relations_created = 0usize;
    for rel in &req.relations {
        ctx.kernel
            .upsert_edge_async(EdgeUpsert {
                source_id: node_id.clone(),
                target_id: rel.target_id.clone(),
                relation: rel.relation.clone(),
                weight: rel.weight,
                metadata: json!({}),
                valid_from: None,
                valid_until: None,
            })
            .await?;
        relations_created += 1;
    }
    Ok(json!({
        "id": stored["id"],
        "name": stored["name"],
        "created_at": stored["created_at"],
        "relations_created": relations_created,
    }))
}

// ------------------------------------------------------------------
// memory.get
// ------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct GetRequest {
    id: String,
    #[serde(default = "default_true")]
    include_relations: bool,
}

async fn get(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: GetRequest = parse(params)?;
    let node = ctx
        .kernel
        .get_node_async(req.id.clone())
        .await?
        .ok_or_else(|| node_not_found(&req.id))?;
    let relations = if req.include_relations {
        ctx.kernel.node_relations_async(req.id.clone()).await?
    } else {
        Vec::new()
    };
    Ok(json!({"node": node, "relations": relations}))
}

// ------------------------------------------------------------------
// memory.search
// ------------------------------------------------------------------

fn default_search_mode() -> String {
    "hybrid".to_string()
}

fn default_max_results() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: String,
    #[serde(default = "default_search_mode")]
    search_mode: String,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    temporal_filter: Option<String>,
    #[serde(default = "default_max_results")]
    max_results: i64,
}

async fn search(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: SearchRequest = parse(params)?;
    let mode = SearchMode::parse(&req.search_mode).ok_or_else(|| {
        ToolError::invalid(format!(
            "Invalid search_mode '{}'. Must be fulltext, tags, or hybrid.",
            req.search_mode
        ))
    })?;
    let started = std::time::Instant::now();
    let results = ctx
        .kernel
        .search_nodes_async(SearchArgs {
            query: req.query,
            mode,
            entity_type: req.entity_type,
            tags: req.tags,
            temporal_filter: req.temporal_filter,
            max_results: req.max_results.clamp(1, 200),
        })
        .await?;
    let total = results.len();
    Ok(json!({
        "results": results,
        "total_matches": total,
        "search_time_ms": started.elapsed().as_millis() as i64,
    }))
}

// ------------------------------------------------------------------
// memory.update
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    id: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn update(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: UpdateRequest = parse(params)?;
    let updated = ctx
        .kernel
        .update_node_async(
            req.id.clone(),
            NodePatch {
                content: req.content,
                name: req.name,
                tags: req.tags,
                metadata: req.metadata,
            },
        )
        .await?
        .ok_or_else(|| node_not_found(&req.id))?;
    Ok(json!({
        "node": {
            "id": updated["id"],
            "name": updated["name"],
            "updated_at": updated["updated_at"],
        },
        "previous_content": updated["previous_content"],
    }))
}

// ------------------------------------------------------------------
// memory.delete
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    id: String,
    #[serde(default)]
    cascade: bool,
}

async fn delete(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: DeleteRequest = parse(params)?;
    let node = ctx
        .kernel
        .get_node_async(req.id.clone())
        .await?
        .ok_or_else(|| node_not_found(&req.id))?;
    let orphans = ctx.kernel.orphan_children_async(req.id.clone()).await?;

    if !req.cascade && !orphans.is_empty() {
        let ids: Vec<&str> = orphans
            .iter()
            .filter_map(|o| o["id"].as_str())
            .collect();
        return Err(ToolError::invalid(format!(
            "Deleting '{}' would orphan {} child node(s): {}. \
             Re-run with cascade=true to delete them too.",
            req.id,
            ids.len(),
            ids.join(", ")
        )));
    }

    let mut deleted_nodes = Vec::new();
    let mut deleted_edges = 0i64;
    if req.cascade {
        for victim in ctx.kernel.cascade_set_async(req.id.clone()).await? {
            let (found, edges) = ctx.kernel.delete_node_async(victim.clone()).await?;
            if found {
                deleted_edges += edges;
                deleted_nodes.push(victim);
            }
        }
    } else {
        let (_, edges) = ctx.kernel.delete_node_async(req.id.clone()).await?;
        deleted_edges = edges;
        deleted_nodes.push(req.id.clone());
    }
    let deleted_count = deleted_nodes.len();
    Ok(json!({
        "deleted_node": {"id": req.id, "name": node["name"]},
        "deleted_nodes": deleted_nodes,
        "deleted_count": deleted_count,
        "deleted_edges": deleted_edges,
        "orphaned_children": [],
    }))
}

// ------------------------------------------------------------------
// memory.link
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LinkRequest {
    source_id: String,
    target_id: String,
    relation: String,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    bidirectional: bool,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_until: Option<String>,
}

async fn link(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: LinkRequest = parse(params)?;
    assert_exists(&ctx, &req.source_id).await?;
    assert_exists(&ctx, &req.target_id).await?;
    let metadata = req.metadata.clone().unwrap_or_else(|| json!({}));
    let created = ctx
        .kernel
        .upsert_edge_async(EdgeUpsert {
            source_id: req.source_id.clone(),
            target_id: req.target_id.clone(),
            relation: req.relation.clone(),
            weight: req.weight,
            metadata: metadata.clone(),
            valid_from: req.valid_from.clone(),
            valid_until: req.valid_until.clone(),
        })
        .await?;
    if req.bidirectional {
        ctx.kernel
            .upsert_edge_async(EdgeUpsert {
                source_id: req.target_id.clone(),
                target_id: req.source_id.clone(),
                relation: req.relation.clone(),
                weight: req.weight,
                metadata,
                valid_from: req.valid_from.clone(),
                valid_until: req.valid_until.clone(),
            })
            .await?;
    }
    Ok(json!({
        "edge": {
            "source_id": req.source_id,
            "target_id": req.target_id,
            "relation": req.relation,
            "weight": req.weight,
        },
        "created": created,
        "bidirectional": req.bidirectional,
    }))
}

// ------------------------------------------------------------------
// Hierarchy and neighborhood reads
// ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdRequest {
    id: String,
}

fn default_depth() -> u32 {
    DEFAULT_TRAVERSAL_DEPTH
}

#[derive(Debug, Deserialize)]
struct TraversalRequest {
    id: String,
    #[serde(default = "default_depth")]
    max_depth: u32,
}

#[derive(Debug, Deserialize)]
struct RelatedRequest {
    id: String,
    #[serde(default)]
    relation: Option<String>,
}

fn nodes_response(nodes: Vec<Value>) -> Value {
    let total = nodes.len();
    json!({"nodes": nodes, "total": total})
}

async fn children(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: IdRequest = parse(params)?;
    assert_exists(&ctx, &req.id).await?;
    Ok(nodes_response(ctx.kernel.node_children_async(req.id).await?))
}

async fn ancestors(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: TraversalRequest = parse(params)?;
    assert_exists(&ctx, &req.id).await?;
    Ok(nodes_response(
        ctx.kernel.node_ancestors_async(req.id, req.max_depth).await?,
    ))
}

async fn subtree(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: TraversalRequest = parse(params)?;
    assert_exists(&ctx, &req.id).await?;
    Ok(nodes_response(
        ctx.kernel.node_subtree_async(req.id, req.max_depth).await?,
    ))
}

async fn roots(ctx: ToolContext, _params: Value) -> HandlerResult {
    Ok(nodes_response(ctx.kernel.node_roots_async().await?))
}

async fn related(ctx: ToolContext, params: Value) -> HandlerResult {
    let req: RelatedRequest = parse(params)?;
    assert_exists(&ctx, &req.id).await?;
    Ok(nodes_response(
        ctx.kernel.node_related_async(req.id, req.relation).await?,
    ))
}

async fn stats(ctx: ToolContext, _params: Value) -> HandlerResult {
    Ok(ctx.kernel.graph_stats_async().await?)
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    let id_schema = json!({
        "type": "object",
        "properties": {"id": {"type": "string"}},
        "required": ["id"],
    });
    let traversal_schema = json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "max_depth": {"type": "integer", "default": DEFAULT_TRAVERSAL_DEPTH, "minimum": 1},
        },
        "required": ["id"],
    });
    vec![
        ToolDescriptor::new(
            "memory",
            "store",
            "Store a knowledge node with optional tags, metadata, and initial relations \
             to existing nodes. The name defaults to the first 60 characters of content.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "name": {"type": ["string", "null"]},
                    "entity_type": {"type": "string", "enum": ENTITY_TYPES, "default": "note"},
                    "tags": {"type": "array", "items": {"type": "string"}, "default": []},
                    "metadata": {"type": ["object", "null"]},
                    "source": {"type": ["string", "null"]},
                    "relations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "target_id": {"type": "string"},
                                "relation": {"type": "string"},
                                "weight": {"type": "number", "default": 1.0},
                            },
                            "required": ["target_id", "relation"],
                        },
                        "default": [],
                    },
                },
                "required": ["content"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(store(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "get",
            "Retrieve a node by id, optionally with its immediate relations in both \
             directions.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "include_relations": {"type": "boolean", "default": true},
                },
                "required": ["id"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(get(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "search",
            "Search the knowledge graph. Modes: fulltext (BM25), tags (all supplied \
             tags required), hybrid (default).",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "default": ""},
                    "search_mode": {"type": "string", "enum": ["fulltext", "tags", "hybrid"], "default": "hybrid"},
                    "entity_type": {"type": ["string", "null"]},
                    "tags": {"type": "array", "items": {"type": "string"}, "default": []},
                    "temporal_filter": {"type": ["string", "null"]},
                    "max_results": {"type": "integer", "default": 20, "minimum": 1},
                },
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(search(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "update",
            "Update any subset of content, name, tags, metadata. Tags replace \
             wholesale; metadata is patch-merged.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "content": {"type": ["string", "null"]},
                    "name": {"type": ["string", "null"]},
                    "tags": {"type": ["array", "null"], "items": {"type": "string"}},
                    "metadata": {"type": ["object", "null"]},
                },
                "required": ["id"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(update(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "delete",
            "Delete a node and its edges. Without cascade the delete is refused if \
             children would orphan; with cascade the orphan set is deleted too.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "cascade": {"type": "boolean", "default": false},
                },
                "required": ["id"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(delete(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "link",
            "Create or update a relation between two nodes. Idempotent on \
             (source, target, relation); bidirectional also upserts the reverse edge.",
            json!({
                "type": "object",
                "properties": {
                    "source_id": {"type": "string"},
                    "target_id": {"type": "string"},
                    "relation": {"type": "string"},
                    "weight": {"type": "number", "default": 1.0},
                    "bidirectional": {"type": "boolean", "default": false},
                    "metadata": {"type": ["object", "null"]},
                    "valid_from": {"type": ["string", "null"]},
                    "valid_until": {"type": ["string", "null"]},
                },
                "required": ["source_id", "target_id", "relation"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(link(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "children",
            "Immediate children via forward parent_of edges.",
            id_schema.clone(),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(children(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "ancestors",
            "All ancestors via reverse parent_of edges, bounded by max_depth.",
            traversal_schema.clone(),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(ancestors(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "subtree",
            "All descendants via forward parent_of edges, excluding the root, \
             bounded by max_depth.",
            traversal_schema,
            false,
            None,
            Arc::new(|ctx, params| Box::pin(subtree(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "roots",
            "Nodes with no incoming parent_of edge.",
            json!({"type": "object", "properties": {}}),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(roots(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "related",
            "All nodes connected to the given node by any edge, optionally filtered \
             to one relation.",
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "relation": {"type": ["string", "null"]},
                },
                "required": ["id"],
            }),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(related(ctx, params))),
        ),
        ToolDescriptor::new(
            "memory",
            "stats",
            "Knowledge graph statistics: counts by type and relation, most connected \
             nodes, orphans, tag frequency.",
            json!({"type": "object", "properties": {}}),
            false,
            None,
            Arc::new(|ctx, params| Box::pin(stats(ctx, params))),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;

    async fn store_simple(ctx: &ToolContext, content: &str) -> String {
        let out = store(ctx.clone(), json!({"content": content})).await.unwrap();
        out["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn store_get_round_trip() {
        let (ctx, _guard) = context().await;
        let out = store(
            ctx.clone(),
            json!({
                "content": "alpha beta",
                "entity_type": "fact",
                "tags": ["t1", "t2"],
                "metadata": {"k": "v"},
            }),
        )
        .await
        .unwrap();
        let id = out["id"].as_str().unwrap();

        let got = get(ctx.clone(), json!({"id": id})).await.unwrap();
        assert_eq!(got["node"]["content"], "alpha beta");
        assert_eq!(got["node"]["entity_type"], "fact");
        assert_eq!(got["node"]["tags"], json!(["t1", "t2"]));
        assert_eq!(got["node"]["name"], "alpha beta");
    }

    #[tokio::test]
    async fn invalid_entity_type_is_rejected() {
        let (ctx, _guard) = context().await;
        let err = store(ctx, json!({"content": "x", "entity_type": "spaceship"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn store_with_relations_validates_targets() {
        let (ctx, _guard) = context().await;
        let parent = store_simple(&ctx, "parent").await;
        let out = store(
            ctx.clone(),
            json!({
                "content": "child",
                "relations": [{"target_id": parent, "relation": "derived_from"}],
            }),
        )
        .await
        .unwrap();
        assert_eq!(out["relations_created"], 1);

        let err = store(
            ctx,
            json!({
                "content": "dangling",
                "relations": [{"target_id": "ghost", "relation": "related_to"}],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn hierarchy_scenario() {
        let (ctx, _guard) = context().await;
        let p = store_simple(&ctx, "parent node").await;
        let c = store_simple(&ctx, "child node").await;
        link(
            ctx.clone(),
            json!({"source_id": p.clone(), "target_id": c.clone(), "relation": PARENT_OF}),
        )
        .await
        .unwrap();

        let sub = subtree(ctx.clone(), json!({"id": p.clone()})).await.unwrap();
        assert_eq!(sub["total"], 1);
        assert_eq!(sub["nodes"][0]["id"].as_str(), Some(c.as_str()));

        let anc = ancestors(ctx.clone(), json!({"id": c.clone()})).await.unwrap();
        assert_eq!(anc["total"], 1);
        assert_eq!(anc["nodes"][0]["id"].as_str(), Some(p.as_str()));

        let r = roots(ctx.clone(), json!({})).await.unwrap();
        let root_ids: Vec<&str> = r["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["id"].as_str().unwrap())
            .collect();
        assert!(root_ids.contains(&p.as_str()));
        assert!(!root_ids.contains(&c.as_str()));

        let kids = children(ctx, json!({"id": p.clone()})).await.unwrap();
        assert_eq!(kids["total"], 1);
    }

    #[tokio::test]
    async fn delete_refuses_orphans_without_cascade() {
        let (ctx, _guard) = context().await;
        let p = store_simple(&ctx, "p").await;
        let c = store_simple(&ctx, "c").await;
        link(
            ctx.clone(),
            json!({"source_id": p.clone(), "target_id": c.clone(), "relation": PARENT_OF}),
        )
        .await
        .unwrap();

        let err = delete(ctx.clone(), json!({"id": p.clone()})).await.unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::InvalidParameter);
        assert!(err.message.contains(&c));

        let out = delete(ctx.clone(), json!({"id": p, "cascade": true}))
            .await
            .unwrap();
        assert_eq!(out["deleted_count"], 2);
        let err = get(ctx, json!({"id": c})).await.unwrap_err();
        assert_eq!(err.kind, hostbridge_protocol::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn link_is_idempotent_and_update_replaces_tags() {
        let (ctx, _guard) = context().await;
        let a = store_simple(&ctx, "a").await;
        let b = store_simple(&ctx, "b").await;
        let first = link(
            ctx.clone(),
            json!({"source_id": a.clone(), "target_id": b.clone(), "relation": "related_to", "weight": 1.0}),
        )
        .await
        .unwrap();
        assert_eq!(first["created"], true);
        let second = link(
            ctx.clone(),
            json!({"source_id": a.clone(), "target_id": b, "relation": "related_to", "weight": 0.4}),
        )
        .await
        .unwrap();
        assert_eq!(second["created"], false);

        update(ctx.clone(), json!({"id": a.clone(), "tags": ["x"]})).await.unwrap();
        update(ctx.clone(), json!({"id": a.clone(), "tags": ["y", "z"]}))
            .await
            .unwrap();
        let got = get(ctx, json!({"id": a, "include_relations": false}))
            .await
            .unwrap();
        assert_eq!(got["node"]["tags"], json!(["y", "z"]));
    }

    #[tokio::test]
    async fn search_and_stats() {
        let (ctx, _guard) = context().await;
        store_simple(&ctx, "the rust borrow checker").await;
        store_simple(&ctx, "gardening in spring").await;
        let out = search(ctx.clone(), json!({"query": "borrow"})).await.unwrap();
        assert_eq!(out["total_matches"], 1);

        let s = stats(ctx, json!({})).await.unwrap();
        assert_eq!(s["total_nodes"], 2);
    }
}
