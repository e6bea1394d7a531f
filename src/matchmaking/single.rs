//! Single-process manager: every match ticks in sequence inside one loop

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::defs::{map_def, TeamMode};
use crate::game::map::MapError;
use crate::game::{Game, GameConfig, GameData, GameError, GameSettings};
use crate::util::rng::random_token;
use crate::util::time::{PerfLog, SyncGate, Ticker, Timer};
use crate::ws::SocketRegistry;

use super::{
    select_oldest_joinable, FindGameParams, FindGameResult, GameManager, ManagerError, GAME_ID_BYTES,
    JOIN_TOKEN_BYTES,
};

/// Socket route of every match in single-process mode
pub const SINGLE_ROUTE: &str = "play";

struct GameSlot {
    game: Game,
    sync_gate: SyncGate,
    stopped_at: Option<Instant>,
}

struct Reservation {
    token: String,
    auto_fill: bool,
    player_count: u8,
}

/// A match whose map is still generating. Requests that land here queue
/// their tokens and wait on `ready`.
struct PendingGame {
    id: String,
    map_name: String,
    team_mode: TeamMode,
    available_slots: usize,
    reservations: Vec<Reservation>,
    ready: watch::Receiver<Option<bool>>,
}

impl PendingGame {
    fn fits(&self, params: &FindGameParams) -> bool {
        self.map_name == params.map_name
            && self.team_mode == params.team_mode
            && self.available_slots >= params.player_count.max(1) as usize
    }

    fn reserve(&mut self, reservation: Reservation) {
        self.available_slots = self
            .available_slots
            .saturating_sub(reservation.player_count.max(1) as usize);
        self.reservations.push(reservation);
    }
}

type GameTable = Arc<Mutex<HashMap<String, GameSlot>>>;
type PendingTable = Arc<Mutex<Vec<PendingGame>>>;

pub struct SingleGameManager {
    config: Arc<Config>,
    settings: GameSettings,
    // lock order: games, then pending
    games: GameTable,
    pending: PendingTable,
    socket_games: DashMap<Uuid, String>,
    sockets: Arc<SocketRegistry>,
}

impl SingleGameManager {
    pub fn new(config: Arc<Config>, sockets: Arc<SocketRegistry>) -> Self {
        let settings = GameSettings::from_config(&config);
        Self::with_settings(config, settings, sockets)
    }

    pub fn with_settings(config: Arc<Config>, settings: GameSettings, sockets: Arc<SocketRegistry>) -> Self {
        Self {
            config,
            settings,
            games: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            socket_games: DashMap::new(),
            sockets,
        }
    }

    /// Spawn the tick loop. It ends once the manager is dropped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let tps = self.config.game_tps;
        let perf_secs = self.config.perf_log_secs;

        tokio::spawn(async move {
            let mut ticker = Ticker::new(tps);
            let mut perf = PerfLog::new(perf_secs);

            loop {
                let dt = ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };

                let timer = Timer::new();
                let now = Instant::now();
                manager.step(dt, now);
                perf.record(timer.elapsed());

                if let Some(report) = perf.report(now) {
                    info!(
                        games = manager.game_count(),
                        players = manager.player_count(),
                        ticks = report.ticks,
                        avg_ms = format!("{:.2}", report.avg_ms),
                        max_ms = format!("{:.2}", report.max_ms),
                        "Tick performance"
                    );
                }
            }
            debug!("Game loop finished");
        })
    }

    /// Tick every live match once, sync the ones that are due and tear
    /// down matches that stopped long enough ago
    pub fn step(&self, dt: f32, now: Instant) {
        let grace = self.config.stopped_worker_grace();
        let mut newly_stopped = Vec::new();
        let mut removed = Vec::new();

        let mut games = self.games.lock();
        for (id, slot) in games.iter_mut() {
            if slot.stopped_at.is_some() {
                continue;
            }

            slot.game.tick(dt);
            if slot.sync_gate.should_sync(now) || slot.game.is_stopped() {
                slot.game.net_sync();
            }
            if slot.game.is_stopped() {
                slot.game.stop("game_over");
                slot.stopped_at = Some(now);
                newly_stopped.push(id.clone());
            }
            self.sockets.dispatch(slot.game.take_outgoing());
        }

        games.retain(|id, slot| match slot.stopped_at {
            Some(at) if now.duration_since(at) >= grace => {
                removed.push(id.clone());
                false
            }
            _ => true,
        });
        drop(games);

        // sockets that never joined are not known to the match itself
        for id in &newly_stopped {
            for entry in self.socket_games.iter().filter(|e| e.value() == id) {
                self.sockets.close(*entry.key());
            }
        }
        for id in removed {
            self.socket_games.retain(|_, game_id| *game_id != id);
            info!(match_id = %id, "Game removed");
        }
    }

    /// Reserve a seat in an existing match. The caller holds the game lock
    /// across selection and reservation so two requests cannot claim the
    /// same last seat.
    fn join_existing(games: &mut HashMap<String, GameSlot>, params: &FindGameParams, token: &str) -> Option<String> {
        let summaries: Vec<GameData> = games
            .values()
            .filter(|s| s.stopped_at.is_none())
            .map(|s| s.game.summary())
            .collect();
        let id = select_oldest_joinable(&summaries, params)?.id.clone();

        let slot = games.get_mut(&id)?;
        match slot.game.add_join_token(token.to_string(), params.auto_fill, params.player_count) {
            Ok(()) => Some(id),
            Err(e) => {
                debug!(match_id = %id, error = %e, "Join token rejected");
                None
            }
        }
    }

    /// Register a pending match and generate it off the async runtime.
    /// The blocking task finishes even if every requester gave up.
    fn start_game(
        &self,
        params: &FindGameParams,
        max_players: usize,
        pending: &mut Vec<PendingGame>,
        first: Reservation,
    ) -> (String, watch::Receiver<Option<bool>>) {
        let id = random_token(GAME_ID_BYTES);
        let (ready_tx, ready_rx) = watch::channel(None);
        let mut entry = PendingGame {
            id: id.clone(),
            map_name: params.map_name.clone(),
            team_mode: params.team_mode,
            available_slots: max_players,
            reservations: Vec::new(),
            ready: ready_rx.clone(),
        };
        entry.reserve(first);
        pending.push(entry);

        let config = GameConfig {
            map_name: params.map_name.clone(),
            team_mode: params.team_mode,
        };
        let settings = self.settings.clone();
        let net_sync_tps = self.config.net_sync_tps;
        let games = Arc::clone(&self.games);
        let pending = Arc::clone(&self.pending);
        let game_id = id.clone();

        tokio::task::spawn_blocking(move || {
            let timer = Timer::new();
            let built = Game::new(game_id.clone(), config, settings);

            let mut games = games.lock();
            let mut pending = pending.lock();
            let Some(idx) = pending.iter().position(|p| p.id == game_id) else {
                return;
            };
            let entry = pending.swap_remove(idx);
            drop(pending);

            match built {
                Ok(mut game) => {
                    for r in entry.reservations {
                        if let Err(e) = game.add_join_token(r.token, r.auto_fill, r.player_count) {
                            warn!(match_id = %game_id, error = %e, "Queued join token rejected");
                        }
                    }
                    info!(
                        match_id = %game_id,
                        map = %entry.map_name,
                        team_mode = ?entry.team_mode,
                        elapsed_ms = timer.elapsed_ms(),
                        "Game created"
                    );
                    games.insert(
                        game_id,
                        GameSlot {
                            game,
                            sync_gate: SyncGate::new(net_sync_tps),
                            stopped_at: None,
                        },
                    );
                    let _ = ready_tx.send(Some(true));
                }
                Err(e) => {
                    warn!(match_id = %game_id, error = %e, "Game creation failed");
                    let _ = ready_tx.send(Some(false));
                }
            }
        });

        (id, ready_rx)
    }

    fn result(&self, game_id: String, token: String) -> FindGameResult {
        FindGameResult {
            game_id,
            token,
            route: SINGLE_ROUTE.to_string(),
        }
    }
}

#[async_trait]
impl GameManager for SingleGameManager {
    fn player_count(&self) -> usize {
        self.games.lock().values().map(|s| s.game.alive_count()).sum()
    }

    fn game_count(&self) -> usize {
        self.games.lock().values().filter(|s| !s.game.is_stopped()).count()
    }

    fn get_by_id(&self, game_id: &str) -> Option<GameData> {
        self.games.lock().get(game_id).map(|s| s.game.summary())
    }

    async fn find_game(&self, params: FindGameParams) -> Result<FindGameResult, ManagerError> {
        let max_players = map_def(&params.map_name)
            .map(|def| def.game_mode.max_players)
            .ok_or_else(|| GameError::Map(MapError::UnknownMap(params.map_name.clone())))?;
        let token = random_token(JOIN_TOKEN_BYTES);

        let (game_id, mut ready) = {
            let mut games = self.games.lock();
            if let Some(game_id) = Self::join_existing(&mut games, &params, &token) {
                return Ok(self.result(game_id, token));
            }

            let reservation = Reservation {
                token: token.clone(),
                auto_fill: params.auto_fill,
                player_count: params.player_count,
            };
            let mut pending = self.pending.lock();
            match pending.iter_mut().find(|p| p.fits(&params)) {
                Some(entry) => {
                    entry.reserve(reservation);
                    debug!(match_id = %entry.id, "Waiting on initializing game");
                    (entry.id.clone(), entry.ready.clone())
                }
                None => self.start_game(&params, max_players, &mut pending, reservation),
            }
        };

        let result = match timeout(self.config.find_game_timeout(), ready.wait_for(Option::is_some)).await {
            Ok(Ok(state)) if *state == Some(true) => Ok(self.result(game_id, token)),
            Ok(_) => Err(ManagerError::Internal(format!("game {game_id} failed to start"))),
            Err(_) => Err(ManagerError::Timeout),
        };
        result
    }

    fn can_accept(&self, route: &str, game_id: &str) -> bool {
        route == SINGLE_ROUTE
            && self
                .games
                .lock()
                .get(game_id)
                .is_some_and(|s| !s.game.is_stopped())
    }

    fn on_open(&self, socket_id: Uuid, game_id: &str) -> bool {
        let open = self
            .games
            .lock()
            .get(game_id)
            .is_some_and(|s| !s.game.is_stopped());
        if open {
            self.socket_games.insert(socket_id, game_id.to_string());
        }
        open
    }

    fn on_msg(&self, socket_id: Uuid, data: Bytes) {
        let Some(game_id) = self.socket_games.get(&socket_id).map(|g| g.value().clone()) else {
            return;
        };
        let mut games = self.games.lock();
        if let Some(slot) = games.get_mut(&game_id) {
            slot.game.handle_msg(socket_id, &data);
            self.sockets.dispatch(slot.game.take_outgoing());
        }
    }

    fn on_close(&self, socket_id: Uuid) {
        let Some((_, game_id)) = self.socket_games.remove(&socket_id) else {
            return;
        };
        let mut games = self.games.lock();
        if let Some(slot) = games.get_mut(&game_id) {
            slot.game.handle_socket_close(socket_id);
            self.sockets.dispatch(slot.game.take_outgoing());
        }
    }

    async fn shutdown(&self) {
        let mut games = self.games.lock();
        for (id, mut slot) in games.drain() {
            slot.game.stop("server_shutdown");
            self.sockets.dispatch(slot.game.take_outgoing());
            debug!(match_id = %id, "Game shut down");
        }
        self.pending.lock().clear();
        drop(games);

        for entry in self.socket_games.iter() {
            self.sockets.close(*entry.key());
        }
        self.socket_games.clear();
        info!("Game manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::TeamMode;
    use crate::ws::protocol::{peek_type, ClientMsg, MsgType, PROTOCOL_VERSION};
    use crate::ws::stream::MsgWriter;
    use crate::ws::SocketCommand;

    fn manager() -> SingleGameManager {
        // map generation is slow in unoptimized test builds
        let config = Arc::new(Config {
            find_game_timeout_secs: 120,
            ..Config::default()
        });
        let settings = GameSettings {
            seed: Some(7),
            ..GameSettings::from_config(&config)
        };
        SingleGameManager::with_settings(config, settings, Arc::new(SocketRegistry::new()))
    }

    fn params(team_mode: TeamMode) -> FindGameParams {
        FindGameParams {
            map_name: "main".into(),
            team_mode,
            auto_fill: true,
            player_count: 1,
        }
    }

    fn join_frame(token: &str) -> Bytes {
        let mut w = MsgWriter::new();
        ClientMsg::Join {
            protocol: PROTOCOL_VERSION,
            token: token.into(),
            name: "tester".into(),
        }
        .encode(&mut w);
        w.take()
    }

    #[tokio::test]
    async fn test_find_game_reuses_open_game() {
        let manager = manager();
        let first = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        let second = manager.find_game(params(TeamMode::Solo)).await.unwrap();

        assert_eq!(first.game_id, second.game_id);
        assert_ne!(first.token, second.token);
        assert_eq!(first.route, SINGLE_ROUTE);
        assert_eq!(manager.game_count(), 1);
    }

    #[tokio::test]
    async fn test_find_game_separates_modes() {
        let manager = manager();
        let solo = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        let duo = manager.find_game(params(TeamMode::Duo)).await.unwrap();
        assert_ne!(solo.game_id, duo.game_id);
    }

    #[tokio::test]
    async fn test_full_game_spills_into_new_one() {
        let manager = manager();
        let first = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        let slots = manager.get_by_id(&first.game_id).unwrap().available_slots;

        for _ in 0..slots {
            let next = manager.find_game(params(TeamMode::Solo)).await.unwrap();
            assert_eq!(next.game_id, first.game_id);
        }
        assert!(!manager.get_by_id(&first.game_id).unwrap().can_join);

        let overflow = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        assert_ne!(overflow.game_id, first.game_id);
        assert_eq!(manager.game_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_initializing_game() {
        let manager = manager();
        let (a, b, c) = tokio::join!(
            manager.find_game(params(TeamMode::Solo)),
            manager.find_game(params(TeamMode::Solo)),
            manager.find_game(params(TeamMode::Solo)),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(a.game_id, b.game_id);
        assert_eq!(a.game_id, c.game_id);
        assert_eq!(manager.game_count(), 1);

        let max_players = map_def("main").unwrap().game_mode.max_players;
        let data = manager.get_by_id(&a.game_id).unwrap();
        assert_eq!(data.available_slots, max_players - 3);
    }

    #[tokio::test]
    async fn test_unknown_map_is_rejected_before_creation() {
        let manager = manager();
        let mut bad = params(TeamMode::Solo);
        bad.map_name = "atlantis".into();

        let err = manager.find_game(bad).await.unwrap_err();
        assert!(matches!(err, ManagerError::Game(GameError::Map(MapError::UnknownMap(_)))));
        assert!(manager.pending.lock().is_empty());
        assert_eq!(manager.game_count(), 0);
    }

    #[tokio::test]
    async fn test_can_accept_checks_route_and_id() {
        let manager = manager();
        let found = manager.find_game(params(TeamMode::Solo)).await.unwrap();

        assert!(manager.can_accept(SINGLE_ROUTE, &found.game_id));
        assert!(!manager.can_accept("play_3", &found.game_id));
        assert!(!manager.can_accept(SINGLE_ROUTE, "missing"));
        assert!(!manager.on_open(Uuid::new_v4(), "missing"));
    }

    #[tokio::test]
    async fn test_join_frames_reach_socket() {
        let manager = manager();
        let found = manager.find_game(params(TeamMode::Solo)).await.unwrap();

        let socket_id = Uuid::new_v4();
        let mut rx = manager.sockets.register(socket_id);
        assert!(manager.on_open(socket_id, &found.game_id));
        manager.on_msg(socket_id, join_frame(&found.token));

        let Some(SocketCommand::Frame(data)) = rx.recv().await else {
            panic!("expected a frame");
        };
        assert_eq!(peek_type(&data).unwrap(), MsgType::Joined);
        assert_eq!(manager.player_count(), 1);

        manager.on_close(socket_id);
        assert_eq!(manager.player_count(), 0);
    }

    #[tokio::test]
    async fn test_step_sends_updates() {
        let manager = manager();
        let found = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        let socket_id = Uuid::new_v4();
        let mut rx = manager.sockets.register(socket_id);
        manager.on_open(socket_id, &found.game_id);
        manager.on_msg(socket_id, join_frame(&found.token));

        manager.step(0.03, Instant::now());

        let mut types = Vec::new();
        while let Ok(SocketCommand::Frame(data)) = rx.try_recv() {
            types.push(peek_type(&data).unwrap());
        }
        assert_eq!(types, vec![MsgType::Joined, MsgType::Map, MsgType::Update]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sockets() {
        let manager = manager();
        let found = manager.find_game(params(TeamMode::Solo)).await.unwrap();
        let socket_id = Uuid::new_v4();
        let mut rx = manager.sockets.register(socket_id);
        manager.on_open(socket_id, &found.game_id);
        manager.on_msg(socket_id, join_frame(&found.token));

        manager.shutdown().await;
        assert_eq!(manager.game_count(), 0);

        let mut last = None;
        while let Ok(cmd) = rx.try_recv() {
            last = Some(cmd);
        }
        assert_eq!(last, Some(SocketCommand::Close));
    }
}
