//! Internal diagnostic HTTP server: liveness, uptime and processing stats.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use sb_sync::SyncManager;

#[derive(Clone)]
pub struct DiagContext {
    pub started: Instant,
    pub manager: Arc<SyncManager>,
    pub stats_enabled: bool,
}

impl DiagContext {
    pub fn new(manager: Arc<SyncManager>, stats_enabled: bool) -> Self {
        Self {
            started: Instant::now(),
            manager,
            stats_enabled,
        }
    }
}

pub fn router(ctx: DiagContext) -> Router {
    let mut router = Router::new()
        .route("/started", get(started))
        .route("/health", get(health));
    if ctx.stats_enabled {
        router = router.route("/stats", get(stats));
    }
    router.with_state(ctx)
}

pub async fn serve(addr: SocketAddr, ctx: DiagContext) -> anyhow::Result<()> {
    let app = router(ctx).layer(TraceLayer::new_for_http());
    info!(%addr, "Starting http server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn started(State(ctx): State<DiagContext>) -> String {
    format!("{:?}", ctx.started.elapsed())
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(ctx): State<DiagContext>) -> impl IntoResponse {
    let snapshot = ctx.manager.stats_snapshot().await;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unable to print statistics: {}", e),
        )
            .into_response(),
    }
}
