use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// Route path constants (single source to reduce drift)
mod paths {
    pub const HEALTH: &str = "/health";
    pub const TOOL_INVOKE: &str = "/api/tools/:category/:name";
    pub const MCP: &str = "/mcp";
    pub const WS_HITL: &str = "/ws/hitl";
    pub const WS_AUDIT: &str = "/ws/audit";
    pub const ADMIN_HITL: &str = "/admin/hitl";
    pub const ADMIN_HITL_ID: &str = "/admin/hitl/:id";
    pub const ADMIN_HITL_APPROVE: &str = "/admin/hitl/:id/approve";
    pub const ADMIN_HITL_REJECT: &str = "/admin/hitl/:id/reject";
    pub const ADMIN_AUDIT: &str = "/admin/audit";
    pub const ADMIN_AUDIT_EXPORT: &str = "/admin/audit/export";
    pub const ADMIN_SECRETS: &str = "/admin/secrets";
    pub const ADMIN_SECRETS_RELOAD: &str = "/admin/secrets/reload";
    pub const ADMIN_TOOLS: &str = "/admin/tools";
}

// Macros to add routes and record them in the endpoints list (avoid drift)
macro_rules! route_get_rec {
    ($router:expr, $endpoints:expr, $path:expr, $handler:path) => {{
        $endpoints.push(format!("GET {}", $path));
        $router.route($path, get($handler))
    }};
}
macro_rules! route_post_rec {
    ($router:expr, $endpoints:expr, $path:expr, $handler:path) => {{
        $endpoints.push(format!("POST {}", $path));
        $router.route($path, post($handler))
    }};
}

mod api_admin;
mod api_meta;
mod api_tools;
mod api_ws;
mod app_state;
mod config;
mod dispatch;
mod egress;
mod error;
mod hitl;
mod mcp;
mod plan;
mod registry;
mod secrets;
mod templates;
mod tools;
mod workspace;

pub(crate) use app_state::AppState;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hostbridge_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cfg = config::Config::load()?;
    let bind = cfg.server.bind.clone();
    let port = cfg.server.port;
    let max_conc = cfg.server.max_concurrency;

    let state = app_state::build(cfg)?;
    state.start_background_jobs();

    let mut endpoints: Vec<String> = Vec::new();
    let mut app = Router::new();
    app = route_get_rec!(app, endpoints, paths::HEALTH, api_meta::health);
    app = route_post_rec!(app, endpoints, paths::TOOL_INVOKE, api_tools::tool_invoke);
    app = route_post_rec!(app, endpoints, paths::MCP, mcp::mcp_endpoint);
    app = route_get_rec!(app, endpoints, paths::WS_HITL, api_ws::ws_hitl);
    app = route_get_rec!(app, endpoints, paths::WS_AUDIT, api_ws::ws_audit);
    app = route_get_rec!(app, endpoints, paths::ADMIN_HITL, api_admin::hitl_list);
    app = route_get_rec!(app, endpoints, paths::ADMIN_HITL_ID, api_admin::hitl_get);
    app = route_post_rec!(app, endpoints, paths::ADMIN_HITL_APPROVE, api_admin::hitl_approve);
    app = route_post_rec!(app, endpoints, paths::ADMIN_HITL_REJECT, api_admin::hitl_reject);
    app = route_get_rec!(app, endpoints, paths::ADMIN_AUDIT, api_admin::audit_query);
    app = route_get_rec!(app, endpoints, paths::ADMIN_AUDIT_EXPORT, api_admin::audit_export);
    app = route_get_rec!(app, endpoints, paths::ADMIN_SECRETS, api_admin::secrets_list);
    app = route_post_rec!(app, endpoints, paths::ADMIN_SECRETS_RELOAD, api_admin::secrets_reload);
    app = route_get_rec!(app, endpoints, paths::ADMIN_TOOLS, api_admin::tools_list);
    info!(routes = endpoints.len(), "routes installed");

    let app = app
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(max_conc));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "hostbridge listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
