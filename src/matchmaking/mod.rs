//! Match lifecycle management
//!
//! A [`GameManager`] owns every running match, places find-game requests and
//! routes socket traffic to the right match. Two strategies exist: every
//! match ticking inside one loop ([`SingleGameManager`]) or every match on its
//! own worker thread ([`GameThreadManager`]).

pub mod service;
pub mod single;
pub mod threads;
pub mod worker;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::defs::TeamMode;
use crate::game::{GameData, GameError};

pub use service::{FindGameBody, FindGameEntry, FindGameResponse};
pub use single::SingleGameManager;
pub use threads::GameThreadManager;

/// Bytes of randomness in a game id
pub const GAME_ID_BYTES: usize = 20;
/// Bytes of randomness in a join token
pub const JOIN_TOKEN_BYTES: usize = 20;

/// A validated request for a seat in a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindGameParams {
    pub map_name: String,
    pub team_mode: TeamMode,
    pub auto_fill: bool,
    pub player_count: u8,
}

/// Where the client connects to and the token it joins with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindGameResult {
    pub game_id: String,
    pub token: String,
    pub route: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error("no free worker slot")]
    NoFreeWorker,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out waiting for the game to start")]
    Timeout,
    #[error("worker went away")]
    WorkerGone,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Owner of every match on this server
#[async_trait]
pub trait GameManager: Send + Sync {
    /// Players alive across all matches
    fn player_count(&self) -> usize;

    /// Matches that have not stopped
    fn game_count(&self) -> usize;

    fn get_by_id(&self, game_id: &str) -> Option<GameData>;

    /// Reserve a seat in the oldest joinable match, creating one if needed
    async fn find_game(&self, params: FindGameParams) -> Result<FindGameResult, ManagerError>;

    /// Whether a socket for `game_id` may be upgraded on `route`
    fn can_accept(&self, route: &str, game_id: &str) -> bool;

    /// Attach a freshly upgraded socket to its match. False if the match is gone.
    fn on_open(&self, socket_id: Uuid, game_id: &str) -> bool;

    fn on_msg(&self, socket_id: Uuid, data: Bytes);

    fn on_close(&self, socket_id: Uuid);

    /// Stop every match and release its resources
    async fn shutdown(&self);
}

/// Oldest joinable match of the requested mode with room for `player_count`
pub fn select_oldest_joinable<'a>(
    games: impl IntoIterator<Item = &'a GameData>,
    params: &FindGameParams,
) -> Option<&'a GameData> {
    games
        .into_iter()
        .filter(|g| {
            g.can_join
                && !g.stopped
                && g.available_slots >= params.player_count.max(1) as usize
                && g.team_mode == params.team_mode
                && g.map_name == params.map_name
        })
        .min_by_key(|g| g.started_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(id: &str, started_time: u64) -> GameData {
        GameData {
            id: id.into(),
            map_name: "main".into(),
            team_mode: TeamMode::Solo,
            can_join: true,
            alive_count: 0,
            available_slots: 80,
            started_time,
            stopped: false,
        }
    }

    fn params() -> FindGameParams {
        FindGameParams {
            map_name: "main".into(),
            team_mode: TeamMode::Solo,
            auto_fill: true,
            player_count: 1,
        }
    }

    #[test]
    fn test_select_prefers_oldest() {
        let games = vec![data("b", 20), data("a", 10), data("c", 30)];
        assert_eq!(select_oldest_joinable(&games, &params()).unwrap().id, "a");
    }

    #[test]
    fn test_select_skips_unjoinable() {
        let mut full = data("full", 1);
        full.available_slots = 0;
        let mut closed = data("closed", 2);
        closed.can_join = false;
        let mut duo = data("duo", 3);
        duo.team_mode = TeamMode::Duo;
        let mut other_map = data("faction", 4);
        other_map.map_name = "faction".into();
        let games = vec![full, closed, duo, other_map, data("ok", 5)];

        assert_eq!(select_oldest_joinable(&games, &params()).unwrap().id, "ok");
    }

    #[test]
    fn test_select_needs_room_for_whole_group() {
        let mut nearly_full = data("a", 1);
        nearly_full.available_slots = 1;
        let games = vec![nearly_full];
        let mut squad = params();
        squad.player_count = 2;
        assert!(select_oldest_joinable(&games, &squad).is_none());
        assert!(select_oldest_joinable(&games, &params()).is_some());
    }
}
