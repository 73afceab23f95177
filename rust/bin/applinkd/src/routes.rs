//! Route registration: module routes plus system endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use provision::worker::ProvisionWorker;

use crate::context_middleware::{self, ContextState};

/// Application shared state.
#[derive(Clone)]
pub struct AppState {
    pub context: Arc<ContextState>,
    pub worker: ProvisionWorker,
}

/// Build the complete router with all routes.
pub fn build_router(state: AppState, module_routes: Vec<(&str, Router)>) -> Router {
    let context = Arc::clone(&state.context);

    let mut app: Router<()> = Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .with_state(state);

    // Module routers carry their own state and are merged at the root.
    for (name, router) in module_routes {
        info!("mounting {} routes", name);
        app = app.merge(router);
    }

    app.layer(middleware::from_fn_with_state(
        context,
        context_middleware::client_context_middleware,
    ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "activeJobs": state.worker.active_jobs(),
    }))
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "applinkd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
