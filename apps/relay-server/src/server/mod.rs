pub mod handlers;
pub mod registry;
pub mod session;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::runtime::RelayRuntime;

pub fn router(runtime: Arc<RelayRuntime>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/events", post(handlers::publish_event))
        .route("/missions", get(handlers::list_missions))
        .route("/diagnostics", get(handlers::get_diagnostics))
        .route("/ws/events", get(handlers::ws_events))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(runtime)
}
