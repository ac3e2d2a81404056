//! Axum router assembly.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use gattbridge_app::ports::data_model::DataModelServer;

use crate::state::AppState;

/// Build the top-level axum [`Router`].
///
/// Serves `/health` plus the `/api` inspection routes. Includes a
/// [`TraceLayer`] that logs each HTTP request/response at the `DEBUG` level
/// using the `tracing` ecosystem.
pub fn build<S: DataModelServer>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api", crate::api::routes::<S>())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
