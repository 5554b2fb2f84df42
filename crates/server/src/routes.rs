//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/s3gc/health", get(handlers::health))
        .route("/admin/s3gc/status", get(handlers::status))
        .route("/admin/s3gc/metrics", get(handlers::metrics))
        .route("/admin/s3gc/config", get(handlers::config))
        .route("/admin/s3gc/run", post(handlers::run_cycle))
        .route("/admin/s3gc/operations", get(handlers::list_operations))
        .route(
            "/admin/s3gc/restore/{operation_id}",
            post(handlers::restore_operation),
        )
        .route("/admin/s3gc/restore-key", post(handlers::restore_key))
        // Every admin route requires the bearer API key.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let mut router = Router::new().merge(admin_routes);

    // Prometheus scrape endpoint is unauthenticated by design; keep it
    // network-restricted at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
