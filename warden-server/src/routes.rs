use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{AppState, events, handlers};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/streamers",
            get(handlers::get_roster).put(handlers::set_roster),
        )
        .route(
            "/api/streamers/{name}",
            get(handlers::get_channel_status).patch(handlers::set_channel_settings),
        )
        .route(
            "/api/streamers/{name}/downloads",
            post(handlers::set_downloads_enabled),
        )
        .route(
            "/api/streamers/{name}/download/start",
            post(handlers::start_recording),
        )
        .route(
            "/api/streamers/{name}/download/stop",
            post(handlers::stop_recording),
        )
        .route(
            "/api/storage-path",
            get(handlers::get_storage_path).put(handlers::set_storage_path),
        )
        .route("/api/status", get(handlers::status_summary))
        .route("/api/events", get(events::stream))
        .route("/api/eventsub/status", get(handlers::push_debug))
        .route("/api/eventsub/reconnect", post(handlers::push_reconnect))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
