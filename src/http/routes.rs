//! HTTP route definitions

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{connect_info::ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::warn;

use crate::app::AppState;
use crate::config::{Config, ProcessMode};
use crate::matchmaking::service::{self, FindGameBody, FindGameResponse};
use crate::matchmaking::single::SINGLE_ROUTE;
use crate::matchmaking::ManagerError;
use crate::util::time::uptime_secs;
use crate::ws::play_handler;

use super::client_ip;

/// Slack on top of the find-game wait before the HTTP layer gives up
const API_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in client_origin)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/api/find_game", post(find_game_handler))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(state.config.find_game_timeout() + API_TIMEOUT_SLACK));

    Router::new()
        .merge(api_routes)
        .merge(play_routes(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `/play` in single-process mode, one `/play_<id>` per worker slot otherwise
fn play_routes(config: &Config) -> Router<AppState> {
    match config.process_mode {
        ProcessMode::Single => Router::new().route(&format!("/{SINGLE_ROUTE}"), get(play_handler)),
        ProcessMode::Multi => (0..config.worker_pool_size)
            .filter_map(|i| config.worker_id_base.checked_add(i))
            .fold(Router::new(), |router, id| {
                router.route(&format!("/{SINGLE_ROUTE}_{id}"), get(play_handler))
            }),
    }
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    region: String,
    uptime_secs: u64,
    active_games: usize,
    active_players: usize,
    open_sockets: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        region: state.config.this_region.clone(),
        uptime_secs: uptime_secs(),
        active_games: state.manager.game_count(),
        active_players: state.manager.player_count(),
        open_sockets: state.sockets.len(),
    })
}

// ============================================================================
// Find-game endpoint
// ============================================================================

async fn find_game_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<FindGameBody>,
) -> Result<Json<FindGameResponse>, AppError> {
    if body.api_key != state.config.api_key {
        warn!("find_game with invalid api key");
        return Err(AppError::Forbidden);
    }

    if let Some(ip) = client_ip(&headers, connect_info.as_ref().map(|c| &c.0)) {
        if state.config.is_banned(&ip) {
            warn!(ip = %ip, "find_game from banned client");
            return Err(AppError::Forbidden);
        }
    }

    let response = service::find_game(&state.config, state.manager.as_ref(), &body).await?;
    Ok(Json(response))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NoFreeWorker | ManagerError::Timeout => AppError::Unavailable(err.to_string()),
            ManagerError::Game(e) => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
