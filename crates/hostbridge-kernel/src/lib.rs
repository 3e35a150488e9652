//! The durable kernel: one SQLite database holding the audit trail and the
//! memory graph. A small connection pool (mutex + condvar) hands connections
//! to synchronous store methods; `*_async` wrappers offload those onto the
//! blocking thread pool so handler tasks never hold a connection across an
//! await point.

use anyhow::{anyhow, Result};
use hostbridge_graph::{EdgeUpsert, GraphStore, NodeInsert, NodePatch, SearchArgs};
use hostbridge_protocol::AuditEntry;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

const DB_FILE: &str = "hostbridge.db";

#[derive(Clone)]
struct KernelPragmas {
    journal_mode: String,
    synchronous: String,
    busy_timeout_ms: u64,
}

impl Default for KernelPragmas {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".into(),
            synchronous: "NORMAL".into(),
            busy_timeout_ms: 5000,
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    cvar: Condvar,
    max_size: usize,
}

struct PoolState {
    conns: Vec<Connection>,
    created: usize,
}

struct ManagedConnection {
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl Deref for ManagedConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
            guard.conns.push(conn);
            drop(guard);
            self.pool.cvar.notify_one();
        }
    }
}

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    pragmas: Arc<KernelPragmas>,
    pool: Arc<PoolShared>,
}

/// Filter set for audit queries. All fields are conjunctive; `q` is a
/// substring search over tool names and error messages.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub category: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub q: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Kernel {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let db_path = state_dir.join(DB_FILE);
        let pragmas = Arc::new(KernelPragmas::default());
        let conn = Connection::open(&db_path)?;
        Self::apply_pragmas(&conn, &pragmas)?;
        Self::init_schema(&conn)?;
        let pool_size = std::env::var("HOSTBRIDGE_SQLITE_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(8);
        let pool = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                conns: vec![conn],
                created: 1,
            }),
            cvar: Condvar::new(),
            max_size: pool_size,
        });
        Ok(Self {
            db_path,
            pragmas,
            pool,
        })
    }

    fn apply_pragmas(conn: &Connection, pragmas: &KernelPragmas) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", &pragmas.journal_mode)?;
        conn.pragma_update(None, "synchronous", &pragmas.synchronous)?;
        conn.busy_timeout(std::time::Duration::from_millis(pragmas.busy_timeout_ms))?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
              id TEXT PRIMARY KEY,
              time TEXT NOT NULL,
              protocol TEXT NOT NULL,
              tool_category TEXT NOT NULL,
              tool_name TEXT NOT NULL,
              status TEXT NOT NULL,
              duration_ms INTEGER,
              error_message TEXT,
              request_params TEXT NOT NULL,
              response_summary TEXT,
              hitl_request_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(time);
            CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_log(tool_category, tool_name);
            CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_log(status);
            "#,
        )?;
        GraphStore::migrate(conn)?;
        Ok(())
    }

    fn conn(&self) -> Result<ManagedConnection> {
        let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
        loop {
            if let Some(conn) = guard.conns.pop() {
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            if guard.created < self.pool.max_size {
                guard.created += 1;
                drop(guard);
                let conn = match Connection::open(&self.db_path) {
                    Ok(c) => c,
                    Err(e) => {
                        let mut guard = self.pool.state.lock().expect("pool mutex poisoned");
                        guard.created -= 1;
                        drop(guard);
                        self.pool.cvar.notify_one();
                        return Err(anyhow!(e));
                    }
                };
                Self::apply_pragmas(&conn, &self.pragmas)?;
                return Ok(ManagedConnection {
                    conn: Some(conn),
                    pool: self.pool.clone(),
                });
            }
            guard = self.pool.cvar.wait(guard).expect("pool condvar poisoned");
        }
    }

    async fn run_blocking<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce(Kernel) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let kernel = self.clone();
        tokio::task::spawn_blocking(move || job(kernel))
            .await
            .map_err(|e| anyhow!("kernel blocking task failed: {e}"))?
    }

    // ------------------------------------------------------------------
    // Audit store
    // ------------------------------------------------------------------

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn()?;
        let params_s =
            serde_json::to_string(&entry.request_params).unwrap_or_else(|_| "{}".into());
        let mut stmt = conn.prepare_cached(
            "INSERT INTO audit_log(id,time,protocol,tool_category,tool_name,status,duration_ms,error_message,request_params,response_summary,hitl_request_id) \
             VALUES(?,?,?,?,?,?,?,?,?,?,?)",
        )?;
        stmt.execute(params![
            entry.id,
            entry.time,
            entry.protocol,
            entry.tool_category,
            entry.tool_name,
            entry.status,
            entry.duration_ms,
            entry.error_message,
            params_s,
            entry.response_summary,
            entry.hitl_request_id,
        ])?;
        Ok(())
    }

    pub async fn append_audit_async(&self, entry: AuditEntry) -> Result<()> {
        self.run_blocking(move |k| k.append_audit(&entry)).await
    }

    fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        let params_s: String = row.get(8)?;
        Ok(AuditEntry {
            id: row.get(0)?,
            time: row.get(1)?,
            protocol: row.get(2)?,
            tool_category: row.get(3)?,
            tool_name: row.get(4)?,
            status: row.get(5)?,
            duration_ms: row.get(6)?,
            error_message: row.get(7)?,
            request_params: serde_json::from_str(&params_s)
                .unwrap_or_else(|_| serde_json::json!({})),
            response_summary: row.get(9)?,
            hitl_request_id: row.get(10)?,
        })
    }

    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id,time,protocol,tool_category,tool_name,status,duration_ms,error_message,request_params,response_summary,hitl_request_id \
             FROM audit_log WHERE 1=1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(cat) = &query.category {
            sql.push_str(" AND tool_category = ?");
            binds.push(Box::new(cat.clone()));
        }
        if let Some(name) = &query.name {
            sql.push_str(" AND tool_name = ?");
            binds.push(Box::new(name.clone()));
        }
        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            binds.push(Box::new(status.clone()));
        }
        if let Some(since) = &query.since {
            sql.push_str(" AND time >= ?");
            binds.push(Box::new(since.clone()));
        }
        if let Some(until) = &query.until {
            sql.push_str(" AND time <= ?");
            binds.push(Box::new(until.clone()));
        }
        if let Some(q) = &query.q {
            sql.push_str(
                " AND (tool_category LIKE ? OR tool_name LIKE ? OR COALESCE(error_message,'') LIKE ?)",
            );
            let like = format!("%{q}%");
            binds.push(Box::new(like.clone()));
            binds.push(Box::new(like.clone()));
            binds.push(Box::new(like));
        }
        sql.push_str(" ORDER BY time DESC LIMIT ? OFFSET ?");
        binds.push(Box::new(query.limit.clamp(1, 1000)));
        binds.push(Box::new(query.offset.max(0)));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            binds.iter().map(|b| b.as_ref()),
        ))?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::map_audit_row(r)?);
        }
        Ok(out)
    }

    pub async fn query_audit_async(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        self.run_blocking(move |k| k.query_audit(&query)).await
    }

    pub fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.query_audit(&AuditQuery {
            limit,
            ..Default::default()
        })
    }

    pub async fn recent_audit_async(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.run_blocking(move |k| k.recent_audit(limit)).await
    }

    /// Delete entries older than the retention horizon. Returns rows removed.
    pub fn prune_audit(&self, older_than_days: u32) -> Result<u64> {
        let conn = self.conn()?;
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let cutoff_s = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let n = conn.execute("DELETE FROM audit_log WHERE time < ?", [cutoff_s])?;
        Ok(n as u64)
    }

    pub async fn prune_audit_async(&self, older_than_days: u32) -> Result<u64> {
        self.run_blocking(move |k| k.prune_audit(older_than_days))
            .await
    }

    pub fn audit_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Memory graph wrappers
    // ------------------------------------------------------------------

    pub fn insert_node(&self, args: &NodeInsert) -> Result<Value> {
        let conn = self.conn()?;
        GraphStore::new(&conn).insert_node(args)
    }

    pub async fn insert_node_async(&self, args: NodeInsert) -> Result<Value> {
        self.run_blocking(move |k| k.insert_node(&args)).await
    }

    pub fn node_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        GraphStore::new(&conn).node_exists(id)
    }

    pub async fn node_exists_async(&self, id: String) -> Result<bool> {
        self.run_blocking(move |k| k.node_exists(&id)).await
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).get_node(id)
    }

    pub async fn get_node_async(&self, id: String) -> Result<Option<Value>> {
        self.run_blocking(move |k| k.get_node(&id)).await
    }

    pub fn node_relations(&self, id: &str) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).node_relations(id)
    }

    pub async fn node_relations_async(&self, id: String) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_relations(&id)).await
    }

    pub fn search_nodes(&self, args: &SearchArgs) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).search(args)
    }

    pub async fn search_nodes_async(&self, args: SearchArgs) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.search_nodes(&args)).await
    }

    pub fn update_node(&self, id: &str, patch: &NodePatch) -> Result<Option<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).update_node(id, patch)
    }

    pub async fn update_node_async(&self, id: String, patch: NodePatch) -> Result<Option<Value>> {
        self.run_blocking(move |k| k.update_node(&id, &patch)).await
    }

    pub fn orphan_children(&self, id: &str) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).orphan_children(id)
    }

    pub async fn orphan_children_async(&self, id: String) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.orphan_children(&id)).await
    }

    pub fn cascade_set(&self, id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).cascade_set(id)
    }

    pub async fn cascade_set_async(&self, id: String) -> Result<Vec<String>> {
        self.run_blocking(move |k| k.cascade_set(&id)).await
    }

    pub fn delete_node(&self, id: &str) -> Result<(bool, i64)> {
        let conn = self.conn()?;
        GraphStore::new(&conn).delete_node(id)
    }

    pub async fn delete_node_async(&self, id: String) -> Result<(bool, i64)> {
        self.run_blocking(move |k| k.delete_node(&id)).await
    }

    pub fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<bool> {
        let conn = self.conn()?;
        GraphStore::new(&conn).upsert_edge(edge)
    }

    pub async fn upsert_edge_async(&self, edge: EdgeUpsert) -> Result<bool> {
        self.run_blocking(move |k| k.upsert_edge(&edge)).await
    }

    pub fn node_children(&self, id: &str) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).children(id)
    }

    pub async fn node_children_async(&self, id: String) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_children(&id)).await
    }

    pub fn node_ancestors(&self, id: &str, max_depth: u32) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).ancestors(id, max_depth)
    }

    pub async fn node_ancestors_async(&self, id: String, max_depth: u32) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_ancestors(&id, max_depth))
            .await
    }

    pub fn node_subtree(&self, id: &str, max_depth: u32) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).subtree(id, max_depth)
    }

    pub async fn node_subtree_async(&self, id: String, max_depth: u32) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_subtree(&id, max_depth))
            .await
    }

    pub fn node_roots(&self) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).roots()
    }

    pub async fn node_roots_async(&self) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_roots()).await
    }

    pub fn node_related(&self, id: &str, relation: Option<&str>) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        GraphStore::new(&conn).related(id, relation)
    }

    pub async fn node_related_async(
        &self,
        id: String,
        relation: Option<String>,
    ) -> Result<Vec<Value>> {
        self.run_blocking(move |k| k.node_related(&id, relation.as_deref()))
            .await
    }

    pub fn graph_stats(&self) -> Result<Value> {
        let conn = self.conn()?;
        GraphStore::new(&conn).stats()
    }

    pub async fn graph_stats_async(&self) -> Result<Value> {
        self.run_blocking(move |k| k.graph_stats()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_protocol::audit_status;
    use serde_json::json;

    fn open_kernel() -> (Kernel, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        (kernel, dir)
    }

    fn entry(status: &str, category: &str) -> AuditEntry {
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            time: AuditEntry::now_rfc3339(),
            protocol: "rest".into(),
            tool_category: category.into(),
            tool_name: "write".into(),
            status: status.into(),
            duration_ms: Some(3),
            error_message: None,
            request_params: json!({"path": "a.txt"}),
            response_summary: Some("{\"ok\":true}".into()),
            hitl_request_id: None,
        }
    }

    #[test]
    fn append_and_query_audit() {
        let (kernel, _dir) = open_kernel();
        kernel.append_audit(&entry(audit_status::SUCCESS, "fs")).unwrap();
        kernel.append_audit(&entry(audit_status::BLOCKED, "fs")).unwrap();
        kernel.append_audit(&entry(audit_status::SUCCESS, "git")).unwrap();

        let all = kernel
            .query_audit(&AuditQuery {
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 3);

        let blocked = kernel
            .query_audit(&AuditQuery {
                status: Some(audit_status::BLOCKED.into()),
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].tool_category, "fs");

        let git = kernel
            .query_audit(&AuditQuery {
                category: Some("git".into()),
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(git.len(), 1);
    }

    #[test]
    fn audit_text_search_covers_error_message() {
        let (kernel, _dir) = open_kernel();
        let mut e = entry(audit_status::ERROR, "http");
        e.error_message = Some("connection refused by upstream".into());
        kernel.append_audit(&e).unwrap();
        kernel.append_audit(&entry(audit_status::SUCCESS, "fs")).unwrap();

        let hits = kernel
            .query_audit(&AuditQuery {
                q: Some("refused".into()),
                limit: 50,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_category, "http");
    }

    #[test]
    fn prune_removes_old_rows_only() {
        let (kernel, _dir) = open_kernel();
        let mut old = entry(audit_status::SUCCESS, "fs");
        old.time = "2001-01-01T00:00:00.000Z".into();
        kernel.append_audit(&old).unwrap();
        kernel.append_audit(&entry(audit_status::SUCCESS, "fs")).unwrap();

        let removed = kernel.prune_audit(30).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(kernel.audit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn async_wrappers_round_trip() {
        let (kernel, _dir) = open_kernel();
        let stored = kernel
            .insert_node_async(NodeInsert {
                name: None,
                content: "kernel async check".into(),
                entity_type: "fact".into(),
                tags: vec!["k".into()],
                metadata: json!({}),
                source: None,
            })
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();
        let node = kernel.get_node_async(id).await.unwrap().unwrap();
        assert_eq!(node["content"], "kernel async check");
    }
}
