//! SQLite helpers backing the HostBridge memory graph: schema migration,
//! node/edge CRUD, FTS5 retrieval, and bounded hierarchy traversals.
//!
//! The graph is content-addressed only in the loose sense that nodes carry
//! opaque uuid ids; edges are keyed by `(source_id, target_id, relation)` so
//! re-linking the same pair updates weight and metadata instead of inserting
//! duplicates. `parent_of` is the one relation that participates in hierarchy
//! traversal (`children` / `ancestors` / `subtree` / `roots`).

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Relation used for hierarchy traversal. Other relations
/// (`related_to`, `depends_on`, `contradicts`, `supersedes`, `derived_from`)
/// are free-form and only surface through `related`.
pub const PARENT_OF: &str = "parent_of";

pub const ENTITY_TYPES: &[&str] = &["concept", "fact", "task", "person", "event", "note"];

pub const DEFAULT_TRAVERSAL_DEPTH: u32 = 10;

/// Lightweight wrapper around a `rusqlite::Connection` that exposes
/// graph-specific helpers. The kernel checks a pooled connection out and
/// constructs one of these per call.
pub struct GraphStore<'c> {
    conn: &'c Connection,
}

#[derive(Debug, Clone, Default)]
pub struct NodeInsert {
    pub name: Option<String>,
    pub content: String,
    pub entity_type: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub content: Option<String>,
    pub name: Option<String>,
    /// Replaces the tag set wholesale when present.
    pub tags: Option<Vec<String>>,
    /// Patch-merged into existing metadata when present.
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct EdgeUpsert {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub weight: f64,
    pub metadata: Value,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fulltext,
    Tags,
    Hybrid,
}

impl SearchMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fulltext" => Some(SearchMode::Fulltext),
            "tags" => Some(SearchMode::Tags),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub query: String,
    pub mode: SearchMode,
    pub entity_type: Option<String>,
    pub tags: Vec<String>,
    /// Upper bound on `created_at` (RFC3339) when present.
    pub temporal_filter: Option<String>,
    pub max_results: i64,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_json_or(raw: Option<String>, default_value: Value) -> Value {
    match raw {
        Some(raw) => serde_json::from_str::<Value>(&raw).unwrap_or(default_value),
        None => default_value,
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let tags_s: Option<String> = row.get(4)?;
    let meta_s: Option<String> = row.get(5)?;
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "content": row.get::<_, String>(2)?,
        "entity_type": row.get::<_, String>(3)?,
        "tags": parse_json_or(tags_s, json!([])),
        "metadata": parse_json_or(meta_s, json!({})),
        "source": row.get::<_, Option<String>>(6)?,
        "created_at": row.get::<_, String>(7)?,
        "updated_at": row.get::<_, String>(8)?,
    }))
}

const NODE_COLS: &str = "id,name,content,entity_type,tags,metadata,source,created_at,updated_at";

impl<'c> GraphStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS memory_nodes (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              content TEXT NOT NULL,
              entity_type TEXT NOT NULL,
              tags TEXT NOT NULL DEFAULT '[]',
              metadata TEXT NOT NULL DEFAULT '{}',
              source TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mem_nodes_type ON memory_nodes(entity_type);
            CREATE INDEX IF NOT EXISTS idx_mem_nodes_created ON memory_nodes(created_at);

            CREATE VIRTUAL TABLE IF NOT EXISTS memory_nodes_fts USING fts5(
              id UNINDEXED,
              name,
              content,
              tags
            );

            CREATE TABLE IF NOT EXISTS memory_edges (
              source_id TEXT NOT NULL,
              target_id TEXT NOT NULL,
              relation TEXT NOT NULL,
              weight REAL NOT NULL DEFAULT 1.0,
              metadata TEXT NOT NULL DEFAULT '{}',
              valid_from TEXT,
              valid_until TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (source_id, target_id, relation)
            );
            CREATE INDEX IF NOT EXISTS idx_mem_edges_target ON memory_edges(target_id);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Insert a node, assigning id and timestamps. The FTS row is written in
    /// the same call so search visibility tracks node visibility.
    pub fn insert_node(&self, args: &NodeInsert) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        let name = args
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| args.content.chars().take(60).collect());
        let tags_s = serde_json::to_string(&args.tags).unwrap_or_else(|_| "[]".into());
        let meta_s = serde_json::to_string(&args.metadata).unwrap_or_else(|_| "{}".into());
        self.conn.execute(
            "INSERT INTO memory_nodes(id,name,content,entity_type,tags,metadata,source,created_at,updated_at) VALUES(?,?,?,?,?,?,?,?,?)",
            params![
                id,
                name,
                args.content,
                args.entity_type,
                tags_s,
                meta_s,
                args.source,
                now,
                now
            ],
        )?;
        self.conn.execute(
            "INSERT INTO memory_nodes_fts(id,name,content,tags) VALUES(?,?,?,?)",
            params![id, name, args.content, args.tags.join(" ")],
        )?;
        Ok(json!({"id": id, "name": name, "created_at": now}))
    }

    pub fn node_exists(&self, id: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM memory_nodes WHERE id=? LIMIT 1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Value>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {NODE_COLS} FROM memory_nodes WHERE id=? LIMIT 1"
        ))?;
        let mut rows = stmt.query([id])?;
        if let Some(r) = rows.next()? {
            Ok(Some(row_to_node(r)?))
        } else {
            Ok(None)
        }
    }

    /// Immediate neighbors over every relation, both directions, with a short
    /// content preview per neighbor.
    pub fn node_relations(&self, id: &str) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let mut stmt = self.conn.prepare_cached(
            "SELECT e.relation, e.weight, n.id, n.name, n.entity_type, SUBSTR(n.content,1,120) \
             FROM memory_edges e JOIN memory_nodes n ON n.id = e.target_id \
             WHERE e.source_id=?",
        )?;
        let mut rows = stmt.query([id])?;
        while let Some(r) = rows.next()? {
            out.push(json!({
                "direction": "outgoing",
                "relation": r.get::<_, String>(0)?,
                "weight": r.get::<_, f64>(1)?,
                "neighbor": {
                    "id": r.get::<_, String>(2)?,
                    "name": r.get::<_, String>(3)?,
                    "entity_type": r.get::<_, String>(4)?,
                    "content_preview": r.get::<_, String>(5)?,
                },
            }));
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT e.relation, e.weight, n.id, n.name, n.entity_type, SUBSTR(n.content,1,120) \
             FROM memory_edges e JOIN memory_nodes n ON n.id = e.source_id \
             WHERE e.target_id=?",
        )?;
        let mut rows = stmt.query([id])?;
        while let Some(r) = rows.next()? {
            out.push(json!({
                "direction": "incoming",
                "relation": r.get::<_, String>(0)?,
                "weight": r.get::<_, f64>(1)?,
                "neighbor": {
                    "id": r.get::<_, String>(2)?,
                    "name": r.get::<_, String>(3)?,
                    "entity_type": r.get::<_, String>(4)?,
                    "content_preview": r.get::<_, String>(5)?,
                },
            }));
        }
        Ok(out)
    }

    /// Update any subset of content/name/tags/metadata. Tags replace, metadata
    /// merges. Returns `None` when the node does not exist, otherwise the
    /// previous content and the effective name.
    pub fn update_node(&self, id: &str, patch: &NodePatch) -> Result<Option<Value>> {
        let existing = match self.get_node(id)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let now = now_iso();
        let prev_content = existing["content"].as_str().unwrap_or_default().to_string();
        let new_content = patch.content.clone().unwrap_or_else(|| prev_content.clone());
        let new_name = patch
            .name
            .clone()
            .unwrap_or_else(|| existing["name"].as_str().unwrap_or_default().to_string());
        let new_tags: Vec<String> = match &patch.tags {
            Some(t) => t.clone(),
            None => existing["tags"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        };
        let new_meta = match &patch.metadata {
            Some(patch_meta) => {
                let mut merged = existing["metadata"].clone();
                merge_json(&mut merged, patch_meta);
                merged
            }
            None => existing["metadata"].clone(),
        };
        self.conn.execute(
            "UPDATE memory_nodes SET content=?, name=?, tags=?, metadata=?, updated_at=? WHERE id=?",
            params![
                new_content,
                new_name,
                serde_json::to_string(&new_tags).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&new_meta).unwrap_or_else(|_| "{}".into()),
                now,
                id
            ],
        )?;
        self.conn
            .execute("DELETE FROM memory_nodes_fts WHERE id=?", [id])?;
        self.conn.execute(
            "INSERT INTO memory_nodes_fts(id,name,content,tags) VALUES(?,?,?,?)",
            params![id, new_name, new_content, new_tags.join(" ")],
        )?;
        Ok(Some(json!({
            "id": id,
            "name": new_name,
            "updated_at": now,
            "previous_content": prev_content,
        })))
    }

    /// Children of `id` whose only parent is `id`: the nodes a non-cascade
    /// delete would orphan.
    pub fn orphan_children(&self, id: &str) -> Result<Vec<Value>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT n.id, n.name FROM memory_nodes n \
             WHERE EXISTS (SELECT 1 FROM memory_edges e \
                           WHERE e.source_id=? AND e.target_id=n.id AND e.relation=?) \
               AND NOT EXISTS (SELECT 1 FROM memory_edges e2 \
                               WHERE e2.source_id != ? AND e2.target_id=n.id AND e2.relation=?)",
        )?;
        let mut rows = stmt.query(params![id, PARENT_OF, id, PARENT_OF])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(json!({"id": r.get::<_, String>(0)?, "name": r.get::<_, String>(1)?}));
        }
        Ok(out)
    }

    /// The transitive set of nodes a cascade delete of `id` removes: `id`
    /// plus every descendant whose parents all lie inside the set. Computed
    /// to a fixpoint so grandchildren orphaned by the cascade are included.
    pub fn cascade_set(&self, id: &str) -> Result<Vec<String>> {
        let mut set: HashSet<String> = HashSet::new();
        set.insert(id.to_string());
        loop {
            let mut grew = false;
            let members: Vec<String> = set.iter().cloned().collect();
            for member in &members {
                for child in self.child_ids(member)? {
                    if set.contains(&child) {
                        continue;
                    }
                    let parents = self.parent_ids(&child)?;
                    if parents.iter().all(|p| set.contains(p)) {
                        set.insert(child);
                        grew = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        Ok(set.into_iter().collect())
    }

    /// Delete a node and every incident edge. Returns `(found, deleted_edges)`.
    pub fn delete_node(&self, id: &str) -> Result<(bool, i64)> {
        if !self.node_exists(id)? {
            return Ok((false, 0));
        }
        let edges: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_edges WHERE source_id=? OR target_id=?",
            params![id, id],
            |r| r.get(0),
        )?;
        self.conn.execute(
            "DELETE FROM memory_edges WHERE source_id=? OR target_id=?",
            params![id, id],
        )?;
        self.conn
            .execute("DELETE FROM memory_nodes_fts WHERE id=?", [id])?;
        self.conn
            .execute("DELETE FROM memory_nodes WHERE id=?", [id])?;
        Ok((true, edges))
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed on `(source, target, relation)`. Returns true
    /// when a new edge was created, false when an existing one was updated.
    pub fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<bool> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM memory_edges WHERE source_id=? AND target_id=? AND relation=?",
                params![edge.source_id, edge.target_id, edge.relation],
                |r| r.get(0),
            )
            .optional()?;
        let now = now_iso();
        let meta_s = serde_json::to_string(&edge.metadata).unwrap_or_else(|_| "{}".into());
        self.conn.execute(
            "INSERT INTO memory_edges(source_id,target_id,relation,weight,metadata,valid_from,valid_until,created_at,updated_at) \
             VALUES(?,?,?,?,?,?,?,?,?) \
             ON CONFLICT(source_id,target_id,relation) DO UPDATE SET \
               weight=excluded.weight, metadata=excluded.metadata, \
               valid_from=excluded.valid_from, valid_until=excluded.valid_until, \
               updated_at=excluded.updated_at",
            params![
                edge.source_id,
                edge.target_id,
                edge.relation,
                edge.weight,
                meta_s,
                edge.valid_from,
                edge.valid_until,
                now,
                now
            ],
        )?;
        Ok(existing.is_none())
    }

    fn child_ids(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT target_id FROM memory_edges WHERE source_id=? AND relation=?",
        )?;
        let mut rows = stmt.query(params![id, PARENT_OF])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(r.get::<_, String>(0)?);
        }
        Ok(out)
    }

    fn parent_ids(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT source_id FROM memory_edges WHERE target_id=? AND relation=?",
        )?;
        let mut rows = stmt.query(params![id, PARENT_OF])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(r.get::<_, String>(0)?);
        }
        Ok(out)
    }

    fn nodes_by_ids(&self, ids: &[String]) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(n) = self.get_node(id)? {
                out.push(n);
            }
        }
        out.sort_by(|a, b| {
            a["created_at"]
                .as_str()
                .unwrap_or("")
                .cmp(b["created_at"].as_str().unwrap_or(""))
        });
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Hierarchy traversal
    // ------------------------------------------------------------------

    /// Immediate children via forward `parent_of` edges.
    pub fn children(&self, id: &str) -> Result<Vec<Value>> {
        let ids = self.child_ids(id)?;
        self.nodes_by_ids(&ids)
    }

    /// Ancestors via reverse `parent_of`, iterative BFS with a visited set.
    /// The depth bound is enforced here rather than in SQL so accounting is
    /// uniform regardless of store capabilities.
    pub fn ancestors(&self, id: &str, max_depth: u32) -> Result<Vec<Value>> {
        self.walk(id, max_depth, |s, n| s.parent_ids(n))
    }

    /// Descendants via forward `parent_of`; the root itself is not included.
    pub fn subtree(&self, id: &str, max_depth: u32) -> Result<Vec<Value>> {
        self.walk(id, max_depth, |s, n| s.child_ids(n))
    }

    fn walk<F>(&self, start: &str, max_depth: u32, step: F) -> Result<Vec<Value>>
    where
        F: Fn(&Self, &str) -> Result<Vec<String>>,
    {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));
        let mut collected: Vec<String> = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in step(self, &node)? {
                if visited.insert(next.clone()) {
                    collected.push(next.clone());
                    queue.push_back((next, depth + 1));
                }
            }
        }
        self.nodes_by_ids(&collected)
    }

    /// Nodes with no incoming `parent_of` edge.
    pub fn roots(&self) -> Result<Vec<Value>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {NODE_COLS} FROM memory_nodes n \
             WHERE NOT EXISTS (SELECT 1 FROM memory_edges e \
                               WHERE e.target_id=n.id AND e.relation='parent_of') \
             ORDER BY created_at"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(row_to_node(r)?);
        }
        Ok(out)
    }

    /// Union of outgoing and incoming neighbors, optionally filtered to one
    /// relation.
    pub fn related(&self, id: &str, relation: Option<&str>) -> Result<Vec<Value>> {
        let mut rows_out: Vec<Value> = Vec::new();
        if let Some(rel) = relation {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT DISTINCT {NODE_COLS} FROM memory_nodes \
                 WHERE id IN ( \
                   SELECT target_id FROM memory_edges WHERE source_id=? AND relation=? \
                   UNION \
                   SELECT source_id FROM memory_edges WHERE target_id=? AND relation=?) \
                 ORDER BY name"
            ))?;
            let mut rows = stmt.query(params![id, rel, id, rel])?;
            while let Some(r) = rows.next()? {
                rows_out.push(row_to_node(r)?);
            }
        } else {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT DISTINCT {NODE_COLS} FROM memory_nodes \
                 WHERE id IN ( \
                   SELECT target_id FROM memory_edges WHERE source_id=? \
                   UNION \
                   SELECT source_id FROM memory_edges WHERE target_id=?) \
                 ORDER BY name"
            ))?;
            let mut rows = stmt.query(params![id, id])?;
            while let Some(r) = rows.next()? {
                rows_out.push(row_to_node(r)?);
            }
        }
        Ok(rows_out)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Hybrid search: FTS5 BM25 ranking, tag conjunction, or both. Hybrid
    /// runs fulltext first and falls back to tag matching when fulltext
    /// yields nothing.
    pub fn search(&self, args: &SearchArgs) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        if matches!(args.mode, SearchMode::Fulltext | SearchMode::Hybrid) {
            results = self.fts_search(args)?;
        }
        let want_tags = matches!(args.mode, SearchMode::Tags)
            || (matches!(args.mode, SearchMode::Hybrid) && results.is_empty());
        if want_tags && !args.tags.is_empty() {
            let mut seen: HashSet<String> = results
                .iter()
                .filter_map(|r| r["node"]["id"].as_str().map(str::to_string))
                .collect();
            for hit in self.tag_search(args)? {
                let id = hit["node"]["id"].as_str().unwrap_or("").to_string();
                if seen.insert(id) {
                    results.push(hit);
                }
            }
        }
        results.truncate(args.max_results.max(0) as usize);
        Ok(results)
    }

    fn fts_search(&self, args: &SearchArgs) -> Result<Vec<Value>> {
        // AND-join sanitized tokens; wrapping the raw query in quotes would
        // force phrase search and miss non-consecutive words.
        let tokens: Vec<String> = args
            .query
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = tokens.join(" ");
        let mut sql = format!(
            "SELECT n.id,n.name,n.content,n.entity_type,n.tags,n.metadata,n.source,n.created_at,n.updated_at, \
                    -bm25(memory_nodes_fts) AS score \
             FROM memory_nodes_fts \
             JOIN memory_nodes n ON n.id = memory_nodes_fts.id \
             WHERE memory_nodes_fts MATCH ?"
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];
        if let Some(et) = &args.entity_type {
            sql.push_str(" AND n.entity_type = ?");
            binds.push(Box::new(et.clone()));
        }
        for tag in &args.tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(n.tags) WHERE value = ?)");
            binds.push(Box::new(tag.clone()));
        }
        if let Some(upper) = &args.temporal_filter {
            sql.push_str(" AND n.created_at <= ?");
            binds.push(Box::new(upper.clone()));
        }
        sql.push_str(" ORDER BY score DESC LIMIT ?");
        binds.push(Box::new(args.max_results));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_iter = rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref()));
        let mut rows = match stmt.query(params_iter) {
            Ok(rows) => rows,
            // FTS5 MATCH syntax errors degrade to no results.
            Err(_) => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let node = row_to_node(r)?;
            let score: f64 = r.get(9)?;
            out.push(json!({
                "node": node,
                "relevance_score": score,
                "matched_field": "content",
            }));
        }
        Ok(out)
    }

    fn tag_search(&self, args: &SearchArgs) -> Result<Vec<Value>> {
        let mut sql = format!("SELECT DISTINCT {NODE_COLS} FROM memory_nodes n WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for tag in &args.tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(n.tags) WHERE value = ?)");
            binds.push(Box::new(tag.clone()));
        }
        if let Some(et) = &args.entity_type {
            sql.push_str(" AND n.entity_type = ?");
            binds.push(Box::new(et.clone()));
        }
        if let Some(upper) = &args.temporal_filter {
            sql.push_str(" AND n.created_at <= ?");
            binds.push(Box::new(upper.clone()));
        }
        sql.push_str(" LIMIT ?");
        binds.push(Box::new(args.max_results));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_iter = rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref()));
        let mut rows = stmt.query(params_iter)?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(json!({
                "node": row_to_node(r)?,
                "relevance_score": 1.0,
                "matched_field": "tags",
            }));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> Result<Value> {
        let total_nodes: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM memory_nodes", [], |r| r.get(0))?;
        let total_edges: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM memory_edges", [], |r| r.get(0))?;

        let mut nodes_by_type = serde_json::Map::new();
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, COUNT(*) FROM memory_nodes GROUP BY entity_type")?;
        let mut rows = stmt.query([])?;
        while let Some(r) = rows.next()? {
            nodes_by_type.insert(r.get::<_, String>(0)?, json!(r.get::<_, i64>(1)?));
        }

        let mut edges_by_relation = serde_json::Map::new();
        let mut stmt = self
            .conn
            .prepare("SELECT relation, COUNT(*) FROM memory_edges GROUP BY relation")?;
        let mut rows = stmt.query([])?;
        while let Some(r) = rows.next()? {
            edges_by_relation.insert(r.get::<_, String>(0)?, json!(r.get::<_, i64>(1)?));
        }

        let mut most_connected = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT n.id, n.name, \
                    (SELECT COUNT(*) FROM memory_edges e WHERE e.source_id=n.id OR e.target_id=n.id) AS edge_count \
             FROM memory_nodes n ORDER BY edge_count DESC LIMIT 10",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(r) = rows.next()? {
            most_connected.push(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "edge_count": r.get::<_, i64>(2)?,
            }));
        }

        let orphaned_nodes: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memory_nodes n \
             WHERE NOT EXISTS (SELECT 1 FROM memory_edges e \
                               WHERE e.source_id=n.id OR e.target_id=n.id)",
            [],
            |r| r.get(0),
        )?;

        let mut tags_frequency = serde_json::Map::new();
        let mut stmt = self.conn.prepare(
            "SELECT jt.value, COUNT(*) AS cnt FROM memory_nodes n, json_each(n.tags) jt \
             GROUP BY jt.value ORDER BY cnt DESC LIMIT 50",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(r) = rows.next()? {
            tags_frequency.insert(r.get::<_, String>(0)?, json!(r.get::<_, i64>(1)?));
        }

        Ok(json!({
            "total_nodes": total_nodes,
            "total_edges": total_edges,
            "nodes_by_type": nodes_by_type,
            "edges_by_relation": edges_by_relation,
            "most_connected_nodes": most_connected,
            "orphaned_nodes": orphaned_nodes,
            "tags_frequency": tags_frequency,
        }))
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match (base_map.get_mut(key), value) {
                    (Some(base_child), Value::Object(_)) => merge_json(base_child, value),
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        GraphStore::migrate(&conn).unwrap();
        conn
    }

    fn store_node(store: &GraphStore<'_>, content: &str, tags: &[&str]) -> String {
        let node = store
            .insert_node(&NodeInsert {
                name: None,
                content: content.to_string(),
                entity_type: "note".to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                metadata: json!({}),
                source: None,
            })
            .unwrap();
        node["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn store_then_get_round_trips() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let id = store_node(&store, "the quick brown fox", &["animals", "speed"]);
        let node = store.get_node(&id).unwrap().unwrap();
        assert_eq!(node["content"], "the quick brown fox");
        assert_eq!(node["name"], "the quick brown fox");
        assert_eq!(node["entity_type"], "note");
        assert_eq!(node["tags"], json!(["animals", "speed"]));
    }

    #[test]
    fn name_defaults_to_first_60_chars() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let long = "x".repeat(200);
        let id = store_node(&store, &long, &[]);
        let node = store.get_node(&id).unwrap().unwrap();
        assert_eq!(node["name"].as_str().unwrap().len(), 60);
    }

    #[test]
    fn link_twice_updates_instead_of_duplicating() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let a = store_node(&store, "a", &[]);
        let b = store_node(&store, "b", &[]);
        let edge = EdgeUpsert {
            source_id: a.clone(),
            target_id: b.clone(),
            relation: "related_to".into(),
            weight: 1.0,
            metadata: json!({}),
            valid_from: None,
            valid_until: None,
        };
        assert!(store.upsert_edge(&edge).unwrap());
        let again = EdgeUpsert {
            weight: 0.5,
            metadata: json!({"note": "updated"}),
            ..edge
        };
        assert!(!store.upsert_edge(&again).unwrap());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let weight: f64 = conn
            .query_row("SELECT weight FROM memory_edges", [], |r| r.get(0))
            .unwrap();
        assert!((weight - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn update_replaces_tags_and_merges_metadata() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let id = store_node(&store, "original", &["old"]);
        store
            .update_node(
                &id,
                &NodePatch {
                    metadata: Some(json!({"k1": "v1"})),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_node(
                &id,
                &NodePatch {
                    tags: Some(vec!["new".into()]),
                    metadata: Some(json!({"k2": "v2"})),
                    ..Default::default()
                },
            )
            .unwrap();
        let node = store.get_node(&id).unwrap().unwrap();
        assert_eq!(node["tags"], json!(["new"]));
        assert_eq!(node["metadata"]["k1"], "v1");
        assert_eq!(node["metadata"]["k2"], "v2");
    }

    #[test]
    fn hierarchy_traversal() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let p = store_node(&store, "parent", &[]);
        let c = store_node(&store, "child", &[]);
        let g = store_node(&store, "grandchild", &[]);
        for (src, dst) in [(&p, &c), (&c, &g)] {
            store
                .upsert_edge(&EdgeUpsert {
                    source_id: src.to_string(),
                    target_id: dst.to_string(),
                    relation: PARENT_OF.into(),
                    weight: 1.0,
                    metadata: json!({}),
                    valid_from: None,
                    valid_until: None,
                })
                .unwrap();
        }
        let sub = store.subtree(&p, DEFAULT_TRAVERSAL_DEPTH).unwrap();
        let ids: Vec<&str> = sub.iter().map(|n| n["id"].as_str().unwrap()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&c.as_str()) && ids.contains(&g.as_str()));
        assert!(!ids.contains(&p.as_str()));

        let anc = store.ancestors(&g, DEFAULT_TRAVERSAL_DEPTH).unwrap();
        let ids: Vec<&str> = anc.iter().map(|n| n["id"].as_str().unwrap()).collect();
        assert!(ids.contains(&p.as_str()) && ids.contains(&c.as_str()));

        let roots = store.roots().unwrap();
        let ids: Vec<&str> = roots.iter().map(|n| n["id"].as_str().unwrap()).collect();
        assert!(ids.contains(&p.as_str()));
        assert!(!ids.contains(&c.as_str()));
    }

    #[test]
    fn traversal_respects_depth_bound() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let mut prev = store_node(&store, "level0", &[]);
        let mut chain = vec![prev.clone()];
        for i in 1..5 {
            let next = store_node(&store, &format!("level{i}"), &[]);
            store
                .upsert_edge(&EdgeUpsert {
                    source_id: prev.clone(),
                    target_id: next.clone(),
                    relation: PARENT_OF.into(),
                    weight: 1.0,
                    metadata: json!({}),
                    valid_from: None,
                    valid_until: None,
                })
                .unwrap();
            prev = next.clone();
            chain.push(next);
        }
        let sub = store.subtree(&chain[0], 2).unwrap();
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn orphan_detection_and_cascade() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let p = store_node(&store, "parent", &[]);
        let only = store_node(&store, "only child", &[]);
        let shared = store_node(&store, "shared child", &[]);
        let other = store_node(&store, "other parent", &[]);
        for (src, dst) in [(&p, &only), (&p, &shared), (&other, &shared)] {
            store
                .upsert_edge(&EdgeUpsert {
                    source_id: src.to_string(),
                    target_id: dst.to_string(),
                    relation: PARENT_OF.into(),
                    weight: 1.0,
                    metadata: json!({}),
                    valid_from: None,
                    valid_until: None,
                })
                .unwrap();
        }
        let orphans = store.orphan_children(&p).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0]["id"].as_str(), Some(only.as_str()));

        let cascade = store.cascade_set(&p).unwrap();
        assert!(cascade.contains(&p));
        assert!(cascade.contains(&only));
        assert!(!cascade.contains(&shared));
    }

    #[test]
    fn fulltext_search_ranks_matches() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        store_node(&store, "rust borrow checker notes", &["rust"]);
        store_node(&store, "gardening tips for spring", &["garden"]);
        let hits = store
            .search(&SearchArgs {
                query: "borrow checker".into(),
                mode: SearchMode::Fulltext,
                entity_type: None,
                tags: vec![],
                temporal_filter: None,
                max_results: 10,
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["node"]["content"], "rust borrow checker notes");
        assert_eq!(hits[0]["matched_field"], "content");
    }

    #[test]
    fn tag_search_requires_all_tags() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        store_node(&store, "both tags", &["a", "b"]);
        store_node(&store, "one tag", &["a"]);
        let hits = store
            .search(&SearchArgs {
                query: String::new(),
                mode: SearchMode::Tags,
                entity_type: None,
                tags: vec!["a".into(), "b".into()],
                temporal_filter: None,
                max_results: 10,
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["node"]["content"], "both tags");
    }

    #[test]
    fn hybrid_falls_back_to_tags() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        store_node(&store, "completely unrelated text", &["target"]);
        let hits = store
            .search(&SearchArgs {
                query: "zzz_no_such_token".into(),
                mode: SearchMode::Hybrid,
                entity_type: None,
                tags: vec!["target".into()],
                temporal_filter: None,
                max_results: 10,
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["matched_field"], "tags");
    }

    #[test]
    fn delete_removes_incident_edges() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let a = store_node(&store, "a", &[]);
        let b = store_node(&store, "b", &[]);
        store
            .upsert_edge(&EdgeUpsert {
                source_id: a.clone(),
                target_id: b.clone(),
                relation: "related_to".into(),
                weight: 1.0,
                metadata: json!({}),
                valid_from: None,
                valid_until: None,
            })
            .unwrap();
        let (found, edges) = store.delete_node(&a).unwrap();
        assert!(found);
        assert_eq!(edges, 1);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn stats_reports_counts() {
        let conn = setup_conn();
        let store = GraphStore::new(&conn);
        let a = store_node(&store, "a", &["t1"]);
        let b = store_node(&store, "b", &["t1", "t2"]);
        store_node(&store, "lonely", &[]);
        store
            .upsert_edge(&EdgeUpsert {
                source_id: a,
                target_id: b,
                relation: "depends_on".into(),
                weight: 1.0,
                metadata: json!({}),
                valid_from: None,
                valid_until: None,
            })
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats["total_nodes"], 3);
        assert_eq!(stats["total_edges"], 1);
        assert_eq!(stats["orphaned_nodes"], 1);
        assert_eq!(stats["nodes_by_type"]["note"], 3);
        assert_eq!(stats["edges_by_relation"]["depends_on"], 1);
        assert_eq!(stats["tags_frequency"]["t1"], 2);
    }
}
