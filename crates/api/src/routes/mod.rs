//! API routes

pub mod health;
pub mod membership;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    chat::{anonymous_chat_handler, chat_handler},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // WebSocket routes (authorization handled in the session join protocol)
    let chat_routes = Router::new()
        .route("/chat/:room_name/:user_id", get(chat_handler))
        .route("/chat/:room_name", get(anonymous_chat_handler));

    // Collaborator ingress - the membership authority reports changes here
    let api_v1_routes = Router::new().route(
        "/rooms/:room_name/membership",
        post(membership::notify_membership_changed),
    );

    let mut router = Router::new()
        .merge(health_routes)
        .merge(chat_routes)
        .nest("/api/v1", api_v1_routes)
        // Inbound frames are small; keep request bodies bounded too
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http());

    if state.config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}
