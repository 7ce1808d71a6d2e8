//! HTTP health surface.
//!
//! Liveness is unconditional: the routes answer 200 while the process is up,
//! and the body says whether dispatch and search are `ready` or `degraded`.

pub mod handlers;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use handlers::{health, AppState};

/// Router carrying the health routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/notification-health", get(health))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
