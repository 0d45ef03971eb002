//! HTTP surface: state, router assembly, and request handlers.

pub mod routes;

use std::sync::Arc;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};

use crate::catalog::CatalogClient;
use crate::llm::ChatClient;
use crate::middleware::rate_limit::{dependencies_rate_limit, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogClient>,
    /// Absent when the model key is not configured; discovery requests are
    /// rejected with 500 at entry.
    pub llm: Option<Arc<dyn ChatClient>>,
    pub limiter: RateLimiter,
}

pub fn router(state: AppState) -> Router {
    // Discovery fans out to the catalog and the model, so it alone sits
    // behind the rate-limit gate.
    let discovery = Router::new()
        .route("/api/dependencies", post(routes::post_dependencies))
        .route_layer(axum_mw::from_fn_with_state(
            state.limiter.clone(),
            dependencies_rate_limit,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/", get(routes::get_manifest))
        .route("/health", get(routes::health_check))
        .route("/api/relations/price", post(routes::post_relations_price))
        .route("/api/relations/graph", post(routes::post_relations_graph))
        .with_state(state)
        .merge(discovery)
}
