//! Route configuration for the HTTP surface.

use super::handlers;
use super::state::AppState;
use axum::routing::{get, post};
use axum::Router;

/// Build the full router: client operations and peer RPCs share one surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & metrics
        .route("/", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Lock manager
        .route(
            "/lock/{name}",
            post(handlers::acquire_lock)
                .delete(handlers::release_lock)
                .get(handlers::lock_status),
        )
        .route("/locks", get(handlers::list_locks))
        // Queue ("/queue/ack/..." must not be swallowed by "/queue/{name}")
        .route("/queue/ack/{processing_key}", post(handlers::ack))
        .route(
            "/queue/{name}",
            post(handlers::produce).get(handlers::consume),
        )
        // Coherent cache (invalidate is peer-only)
        .route("/cache/invalidate/{key}", post(handlers::cache_invalidate))
        .route(
            "/cache/{key}",
            get(handlers::cache_get).post(handlers::cache_put),
        )
        // PBFT
        .route("/pbft/request", post(handlers::pbft_request))
        .route("/pbft/message", post(handlers::pbft_message))
        .route("/pbft/status", get(handlers::pbft_status))
        .route(
            "/pbft/simulate-byzantine",
            post(handlers::pbft_simulate_byzantine),
        )
        // Raft peer RPCs
        .route("/raft/request-vote", post(handlers::raft_request_vote))
        .route("/raft/append-entries", post(handlers::raft_append_entries))
        .with_state(state)
}
