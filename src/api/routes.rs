//! API route definitions

use axum::routing::{delete, get, post, put};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/status", get(handlers::health::status))
        // Lease operations
        .route("/api/leases", post(handlers::lease::reserve))
        .route("/api/leases", delete(handlers::lease::release_all))
        .route("/api/leases/reset", post(handlers::lease::reset_all))
        .route("/api/leases/:id/refresh", post(handlers::lease::refresh))
        .route("/api/leases/:id", delete(handlers::lease::release))
        // Pool management
        .route("/api/proxies", get(handlers::proxy::list_proxies))
        .route("/api/proxies", post(handlers::proxy::create_proxy))
        .route("/api/proxies/:id", get(handlers::proxy::get_proxy))
        .route("/api/proxies/:id", put(handlers::proxy::update_proxy))
        .route("/api/proxies/:id", delete(handlers::proxy::delete_proxy))
        .with_state(state)
}
