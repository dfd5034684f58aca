use crate::handlers;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Every route as `(method, path)`, listed by the index endpoint.
pub const ENDPOINTS: &[(&str, &str)] = &[
    ("GET", "/"),
    ("GET", "/health"),
    ("GET", "/metrics"),
    ("GET", "/backup/tables"),
    ("GET", "/backup/list"),
    ("POST", "/backup/create"),
    ("POST", "/backup/freeze"),
    ("POST", "/backup/clean"),
    ("POST", "/backup/upload/{name}"),
    ("POST", "/backup/download/{name}"),
    ("POST", "/backup/restore/{name}"),
    ("POST", "/backup/delete/{where}/{name}"),
    ("GET", "/backup/config/default"),
    ("GET", "/backup/config"),
    ("POST", "/backup/config"),
];

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::serve_metrics))
        // Read-only
        .route("/backup/tables", get(handlers::tables))
        .route("/backup/list", get(handlers::list))
        .route("/backup/config/default", get(handlers::default_config))
        // Mutating, serialized by the operation lock
        .route("/backup/create", post(handlers::create))
        .route("/backup/freeze", post(handlers::freeze))
        .route("/backup/clean", post(handlers::clean))
        .route("/backup/upload/{name}", post(handlers::upload))
        .route("/backup/download/{name}", post(handlers::download))
        .route("/backup/restore/{name}", post(handlers::restore))
        .route("/backup/delete/{where}/{name}", post(handlers::delete))
        .route(
            "/backup/config",
            get(handlers::current_config).post(handlers::update_config),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
