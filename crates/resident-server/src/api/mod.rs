//! API routes and handlers

mod backends;
mod events;
mod history;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let server = state.orchestrator.config().server.clone();

    let v1_routes = Router::new()
        // Lifecycle control
        .route("/backends/:backend", get(backends::status))
        .route("/backends/:backend/pause", post(backends::pause))
        .route("/backends/:backend/resume", post(backends::resume))
        .route("/backends/:backend/restart", post(backends::restart))
        // Inference
        .route("/:backend", post(backends::infer));

    let api_routes = Router::new()
        .route("/dates", get(history::list_dates))
        .route("/history/:date", get(history::list_records))
        .route("/events", get(events::stream_events));

    let mut router = Router::new()
        .route("/health", get(backends::health))
        .route("/artifacts/:date/:name", get(history::get_artifact))
        .nest("/v1", v1_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http());

    if server.cors_enabled {
        let origins = if server.cors_origins.is_empty() {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(
                server
                    .cors_origins
                    .iter()
                    .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
            )
        };
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
