//! End-to-end placement through the HTTP API

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;

use royale_server::app::AppState;
use royale_server::config::Config;
use royale_server::http::build_router;

fn config() -> Config {
    // generous timeouts: map generation is slow in unoptimized builds
    Config {
        find_game_timeout_secs: 120,
        join_token_ttl_secs: 600,
        empty_game_timeout_secs: 600,
        ..Config::default()
    }
}

async fn find_game(router: &Router, api_key: &str, player_count: u8) -> Value {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/find_game")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "region": "local",
                "zones": ["local"],
                "version": 1,
                "playerCount": player_count,
                "autoFill": true,
                "gameModeIdx": 0,
                "apiKey": api_key,
            })
            .to_string(),
        ))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = assert_ok!(to_bytes(response.into_body(), usize::MAX).await);
    let body: Value = assert_ok!(serde_json::from_slice(&bytes));
    body["res"][0].clone()
}

#[tokio::test]
async fn test_requests_share_a_game_until_it_is_full() {
    let config = config();
    let api_key = config.api_key.clone();
    let state = AppState::new(config);
    let manager = state.manager.clone();
    let router = build_router(state);

    let first = find_game(&router, &api_key, 1).await;
    let game_id = first["gameId"].as_str().unwrap().to_string();
    let second = find_game(&router, &api_key, 1).await;
    assert_eq!(second["gameId"], game_id.as_str());
    assert_ne!(second["data"], first["data"]);

    let remaining = manager.get_by_id(&game_id).unwrap().available_slots;
    for _ in 0..remaining {
        let entry = find_game(&router, &api_key, 1).await;
        assert_eq!(entry["gameId"], game_id.as_str());
    }
    assert!(!manager.get_by_id(&game_id).unwrap().can_join);

    let overflow = find_game(&router, &api_key, 1).await;
    assert_ne!(overflow["gameId"], game_id.as_str());
    assert_eq!(manager.game_count(), 2);
}

#[tokio::test]
async fn test_health_counts_games() {
    let config = config();
    let api_key = config.api_key.clone();
    let router = build_router(AppState::new(config));

    find_game(&router, &api_key, 1).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = assert_ok!(to_bytes(response.into_body(), usize::MAX).await);
    let body: Value = assert_ok!(serde_json::from_slice(&bytes));
    assert_eq!(body["active_games"], 1);
    assert_eq!(body["active_players"], 0);
}
