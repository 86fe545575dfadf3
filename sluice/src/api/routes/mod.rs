//! API route modules.

pub mod health;
pub mod stream_proxy;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/stream", stream_proxy::router())
        .nest("/health", health::router())
        .with_state(state)
}
