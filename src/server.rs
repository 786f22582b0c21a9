/// Admin HTTP server: health and Prometheus metrics
use crate::{
    context::AppContext,
    db,
    error::{HookError, HookResult},
    metrics,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the admin router
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// Health check handler: pings the coordination store and the subscription database
async fn health_check(State(ctx): State<AppContext>) -> impl IntoResponse {
    let store = ctx.store.ping().await;
    let database = db::test_connection(&ctx.subscription_db).await;
    let healthy = store.is_ok() && database.is_ok();

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "version": ctx.config.service.version,
            "checks": {
                "store": check_status(&store),
                "database": check_status(&database),
            }
        })),
    )
}

fn check_status(result: &HookResult<()>) -> serde_json::Value {
    match result {
        Ok(()) => json!({ "status": "ok" }),
        Err(e) => json!({ "status": "error", "kind": e.kind() }),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Serve the admin router until `shutdown` resolves
pub async fn serve<F>(ctx: AppContext, shutdown: F) -> HookResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = ctx.bind_address();
    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| HookError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Admin server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HookError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
