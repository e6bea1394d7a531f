//! WebSocket upgrade handler for the play routes

use std::net::SocketAddr;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::http::client_ip;
use crate::util::rate_limit::SocketRateLimiter;

use super::sockets::SocketCommand;

/// Query parameters of a play connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayQuery {
    pub game_id: Option<String>,
}

/// WebSocket upgrade handler for `/play` and `/play_<worker>`. The game
/// check runs before the upgrade headers are looked at.
pub async fn play_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    uri: Uri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<PlayQuery>,
    State(state): State<AppState>,
) -> Response {
    let route = uri.path().trim_start_matches('/');

    if let Some(ip) = client_ip(&headers, connect_info.as_ref().map(|c| &c.0)) {
        if state.config.is_banned(&ip) {
            warn!(ip = %ip, "Banned client tried to connect");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let Some(game_id) = query.game_id.filter(|id| state.manager.can_accept(route, id)) else {
        debug!(route, "Rejected upgrade for unknown game");
        return StatusCode::FORBIDDEN.into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, game_id, state))
}

/// Run one upgraded connection until either side closes it
async fn handle_socket(socket: WebSocket, game_id: String, state: AppState) {
    let socket_id = Uuid::new_v4();
    let mut outbound = state.sockets.register(socket_id);

    if !state.manager.on_open(socket_id, &game_id) {
        info!(socket_id = %socket_id, match_id = %game_id, "Game gone before socket opened");
        state.sockets.unregister(&socket_id);
        let (mut ws_sink, _) = socket.split();
        let _ = ws_sink.close().await;
        return;
    }
    debug!(socket_id = %socket_id, match_id = %game_id, "Socket opened");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: match frames -> WebSocket
    let writer_socket_id = socket_id;
    let mut writer_handle = tokio::spawn(async move {
        while let Some(cmd) = outbound.recv().await {
            match cmd {
                SocketCommand::Frame(data) => {
                    if let Err(e) = ws_sink.send(Message::Binary(data.to_vec())).await {
                        debug!(socket_id = %writer_socket_id, error = %e, "WebSocket send failed");
                        return;
                    }
                }
                SocketCommand::Close => break,
            }
        }
        let _ = ws_sink.close().await;
    });

    let rate_limiter = SocketRateLimiter::new(state.config.socket_frame_rate);
    let idle_timeout = state.config.socket_idle_timeout();

    // Reader loop: WebSocket -> match
    loop {
        let next = tokio::select! {
            next = timeout(idle_timeout, ws_stream.next()) => next,
            _ = &mut writer_handle => {
                debug!(socket_id = %socket_id, "Writer finished");
                break;
            }
        };

        let Ok(next) = next else {
            info!(socket_id = %socket_id, "Socket idle, closing");
            break;
        };

        match next {
            Some(Ok(Message::Binary(data))) => {
                if !rate_limiter.check_frame() {
                    warn!(socket_id = %socket_id, "Rate limited frame");
                    continue;
                }
                state.manager.on_msg(socket_id, Bytes::from(data));
            }
            Some(Ok(Message::Text(_))) => {
                debug!(socket_id = %socket_id, "Received text message, ignoring");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!(socket_id = %socket_id, "Client closed");
                break;
            }
            Some(Err(e)) => {
                debug!(socket_id = %socket_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.manager.on_close(socket_id);
    state.sockets.unregister(&socket_id);
    writer_handle.abort();

    debug!(socket_id = %socket_id, match_id = %game_id, "Socket closed");
}
