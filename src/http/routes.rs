//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.client_origins))
        .with_state(state)
}

/// Listed origins only, or any origin when none are configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(allowed)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    rooms: usize,
    players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        rooms: state.rooms.room_count(),
        players: state.rooms.total_players(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GameConfig};

    fn state() -> AppState {
        AppState::new(Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            client_origins: Vec::new(),
            game: GameConfig {
                world_seed: Some(3),
                ..GameConfig::default()
            },
        })
    }

    #[tokio::test]
    async fn health_counts_rooms() {
        let state = state();
        state.rooms.get_or_spawn("lobby");
        state.rooms.get_or_spawn("second");

        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.rooms, 2);
        assert_eq!(health.players, 0);
    }

    #[test]
    fn router_builds_with_and_without_origins() {
        let mut state = state();
        let _ = build_router(state.clone());

        let mut config = (*state.config).clone();
        config.client_origins = vec!["http://localhost:5173".to_string(), "bad\norigin".to_string()];
        state.config = std::sync::Arc::new(config);
        let _ = build_router(state);
    }
}
