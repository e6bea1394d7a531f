//! Multi-worker manager: every match runs on its own worker thread
//!
//! Workers are addressed by a route id drawn from a fixed pool
//! (`/play_<id>`). A worker whose match stopped is reused for the next new
//! match before another thread is spawned.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::defs::map_def;
use crate::game::{GameConfig, GameData};
use crate::util::rng::random_token;
use crate::ws::SocketRegistry;

use super::worker::{spawn_worker, SocketFrame, ThreadMsg, WorkerSettings};
use super::{
    select_oldest_joinable, FindGameParams, FindGameResult, GameManager, ManagerError, GAME_ID_BYTES,
    JOIN_TOKEN_BYTES,
};

const ROUTE_PREFIX: &str = "play_";

/// Manager side view of one worker
struct WorkerHandle {
    id: u16,
    tx: UnboundedSender<ThreadMsg>,
    thread: Option<JoinHandle<()>>,
    /// Last summary the worker reported, or the placeholder written at create
    data: GameData,
    last_msg: Instant,
    stopped_at: Instant,
    created_waiters: Vec<oneshot::Sender<()>>,
}

impl WorkerHandle {
    fn send(&self, msg: ThreadMsg) {
        if self.tx.send(msg).is_err() {
            debug!(worker_id = self.id, "Worker channel closed");
        }
    }

    /// Idle and not in the middle of bringing a match up
    fn is_reusable(&self) -> bool {
        self.data.stopped && self.created_waiters.is_empty()
    }

    /// Summary used for placement. A worker still bringing its match up
    /// counts as running so requests queue on it instead of spawning more.
    fn candidate(&self) -> GameData {
        let mut data = self.data.clone();
        if !self.created_waiters.is_empty() {
            data.stopped = false;
        }
        data
    }

    fn create(&mut self, game_id: String, config: GameConfig) {
        let max_players = map_def(&config.map_name)
            .map(|def| def.game_mode.max_players)
            .unwrap_or_default();
        self.data = GameData {
            id: game_id.clone(),
            map_name: config.map_name.clone(),
            team_mode: config.team_mode,
            can_join: true,
            alive_count: 0,
            available_slots: max_players,
            started_time: 0,
            stopped: true,
        };
        self.send(ThreadMsg::Create { id: game_id, config });
    }

    /// The cached slot count drops right away so the next request does not
    /// pick a match the worker has not reported as full yet
    fn add_join_token(&mut self, token: String, params: &FindGameParams) {
        self.send(ThreadMsg::AddJoinToken {
            token,
            auto_fill: params.auto_fill,
            player_count: params.player_count,
        });
        self.data.available_slots = self
            .data
            .available_slots
            .saturating_sub(params.player_count.max(1) as usize);
    }
}

#[derive(Default)]
struct WorkerTable {
    workers: HashMap<u16, WorkerHandle>,
    by_game: HashMap<String, u16>,
    free_ids: Vec<u16>,
}

impl WorkerTable {
    fn worker_for_game(&self, game_id: &str) -> Option<&WorkerHandle> {
        self.by_game.get(game_id).and_then(|id| self.workers.get(id))
    }

    fn rebind(&mut self, worker_id: u16, old_game: &str, new_game: &str) {
        if old_game == new_game {
            return;
        }
        if self.by_game.get(old_game) == Some(&worker_id) {
            self.by_game.remove(old_game);
        }
        self.by_game.insert(new_game.to_string(), worker_id);
    }
}

pub struct GameThreadManager {
    config: Arc<Config>,
    settings: WorkerSettings,
    table: Mutex<WorkerTable>,
    socket_workers: DashMap<Uuid, u16>,
    sockets: Arc<SocketRegistry>,
    to_manager: UnboundedSender<(u16, ThreadMsg)>,
    inbox: Mutex<Option<UnboundedReceiver<(u16, ThreadMsg)>>>,
}

impl GameThreadManager {
    pub fn new(config: Arc<Config>, sockets: Arc<SocketRegistry>) -> Self {
        let settings = WorkerSettings::from_config(&config);
        Self::with_settings(config, settings, sockets)
    }

    pub fn with_settings(config: Arc<Config>, settings: WorkerSettings, sockets: Arc<SocketRegistry>) -> Self {
        let (to_manager, inbox) = mpsc::unbounded_channel();
        let base = config.worker_id_base;
        // popped from the back, so the lowest id goes first
        let free_ids = (0..config.worker_pool_size)
            .rev()
            .filter_map(|i| base.checked_add(i))
            .collect();

        Self {
            config,
            settings,
            table: Mutex::new(WorkerTable {
                free_ids,
                ..WorkerTable::default()
            }),
            socket_workers: DashMap::new(),
            sockets,
            to_manager,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Spawn the worker message pump and the heartbeat task. Both end once
    /// the manager is dropped.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(mut inbox) = self.inbox.lock().take() {
            let manager: Weak<Self> = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                while let Some((worker_id, msg)) = inbox.recv().await {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_worker_msg(worker_id, msg);
                }
            }));
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.keepalive();
        tasks.push(tokio::spawn(async move {
            let mut heartbeat = interval(period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                heartbeat.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.heartbeat(Instant::now());
            }
        }));

        tasks
    }

    /// Apply one message from a worker
    pub fn handle_worker_msg(&self, worker_id: u16, msg: ThreadMsg) {
        match msg {
            ThreadMsg::SocketMsg { msgs } => {
                for SocketFrame { socket_id, data } in msgs {
                    self.sockets.send(socket_id, data);
                }
                self.touch(worker_id);
            }
            ThreadMsg::SocketClose { socket_id } => {
                self.sockets.close(socket_id);
                self.touch(worker_id);
            }
            ThreadMsg::Created(data) => {
                let mut table = self.table.lock();
                let previous = match table.workers.get(&worker_id) {
                    Some(worker) => worker.data.id.clone(),
                    None => return,
                };
                table.rebind(worker_id, &previous, &data.id);
                if let Some(worker) = table.workers.get_mut(&worker_id) {
                    worker.last_msg = Instant::now();
                    // tokens queued during creation are not in the worker's count yet
                    let available_slots = data.available_slots.min(worker.data.available_slots);
                    worker.data = GameData { available_slots, ..data };
                    for waiter in worker.created_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
            }
            ThreadMsg::UpdateData(data) => {
                let mut table = self.table.lock();
                let previous = match table.workers.get(&worker_id) {
                    // summary of the match being replaced
                    Some(worker) if !worker.created_waiters.is_empty() && worker.data.id != data.id => return,
                    Some(worker) => worker.data.id.clone(),
                    None => return,
                };
                table.rebind(worker_id, &previous, &data.id);
                if let Some(worker) = table.workers.get_mut(&worker_id) {
                    let now = Instant::now();
                    worker.last_msg = now;
                    if data.stopped && !worker.data.stopped {
                        worker.stopped_at = now;
                        info!(worker_id, match_id = %data.id, "Game stopped");
                    }
                    worker.data = data;
                }
            }
            ThreadMsg::KeepAlive => self.touch(worker_id),
            other => debug!(worker_id, msg = ?other, "Unexpected message from worker"),
        }
    }

    fn touch(&self, worker_id: u16) {
        if let Some(worker) = self.table.lock().workers.get_mut(&worker_id) {
            worker.last_msg = Instant::now();
        }
    }

    /// Ping every worker and kill the ones that went silent or have been
    /// idle since their match stopped
    pub fn heartbeat(&self, now: Instant) {
        let timeout = self.config.worker_timeout();
        let grace = self.config.stopped_worker_grace();

        let doomed: Vec<u16> = {
            let table = self.table.lock();
            table
                .workers
                .values()
                .filter_map(|worker| {
                    worker.send(ThreadMsg::KeepAlive);
                    let finished = worker.thread.as_ref().is_some_and(|t| t.is_finished());
                    if finished || now.duration_since(worker.last_msg) > timeout {
                        warn!(worker_id = worker.id, match_id = %worker.data.id, "Worker unresponsive, killing");
                        Some(worker.id)
                    } else if worker.is_reusable() && now.duration_since(worker.stopped_at) > grace {
                        info!(worker_id = worker.id, match_id = %worker.data.id, "Worker idle, killing");
                        Some(worker.id)
                    } else {
                        None
                    }
                })
                .collect()
        };

        for worker_id in doomed {
            self.kill_worker(worker_id);
        }
    }

    fn kill_worker(&self, worker_id: u16) {
        let worker = {
            let mut table = self.table.lock();
            let Some(worker) = table.workers.remove(&worker_id) else {
                return;
            };
            if table.by_game.get(&worker.data.id) == Some(&worker_id) {
                table.by_game.remove(&worker.data.id);
            }
            table.free_ids.push(worker_id);
            worker
        };
        worker.send(ThreadMsg::Shutdown);

        let orphaned: Vec<Uuid> = self
            .socket_workers
            .iter()
            .filter(|e| *e.value() == worker_id)
            .map(|e| *e.key())
            .collect();
        for socket_id in orphaned {
            self.socket_workers.remove(&socket_id);
            self.sockets.close(socket_id);
        }
        // a wedged thread is detached; its channel is gone either way
        drop(worker.thread);
    }

    /// Reuse a stopped worker or spawn a new one, and ask it for a match
    fn place_new_game(
        &self,
        table: &mut WorkerTable,
        params: &FindGameParams,
        token: String,
    ) -> Result<(u16, String, oneshot::Receiver<()>), ManagerError> {
        let reusable = table
            .workers
            .values()
            .filter(|w| w.is_reusable())
            .map(|w| w.id)
            .min();
        let worker_id = match reusable {
            Some(id) => id,
            None => {
                let id = table.free_ids.pop().ok_or(ManagerError::NoFreeWorker)?;
                match spawn_worker(id, self.settings.clone(), self.to_manager.clone()) {
                    Ok((tx, thread)) => {
                        let now = Instant::now();
                        table.workers.insert(
                            id,
                            WorkerHandle {
                                id,
                                tx,
                                thread: Some(thread),
                                data: GameData {
                                    id: String::new(),
                                    map_name: String::new(),
                                    team_mode: params.team_mode,
                                    can_join: false,
                                    alive_count: 0,
                                    available_slots: 0,
                                    started_time: 0,
                                    stopped: true,
                                },
                                last_msg: now,
                                stopped_at: now,
                                created_waiters: Vec::new(),
                            },
                        );
                        info!(worker_id = id, "Worker spawned");
                        id
                    }
                    Err(e) => {
                        table.free_ids.push(id);
                        return Err(e.into());
                    }
                }
            }
        };

        let game_id = random_token(GAME_ID_BYTES);
        let (tx, rx) = oneshot::channel();
        let previous = {
            let worker = table.workers.get_mut(&worker_id).ok_or(ManagerError::WorkerGone)?;
            let previous = worker.data.id.clone();
            worker.create(
                game_id.clone(),
                GameConfig {
                    map_name: params.map_name.clone(),
                    team_mode: params.team_mode,
                },
            );
            worker.created_waiters.push(tx);
            worker.add_join_token(token, params);
            previous
        };
        table.rebind(worker_id, &previous, &game_id);

        Ok((worker_id, game_id, rx))
    }

    fn route(worker_id: u16) -> String {
        format!("{ROUTE_PREFIX}{worker_id}")
    }

    fn parse_route(route: &str) -> Option<u16> {
        route.strip_prefix(ROUTE_PREFIX)?.parse().ok()
    }
}

#[async_trait]
impl GameManager for GameThreadManager {
    fn player_count(&self) -> usize {
        self.table.lock().workers.values().map(|w| w.data.alive_count).sum()
    }

    fn game_count(&self) -> usize {
        self.table.lock().workers.values().filter(|w| !w.data.stopped).count()
    }

    fn get_by_id(&self, game_id: &str) -> Option<GameData> {
        self.table.lock().worker_for_game(game_id).map(|w| w.data.clone())
    }

    async fn find_game(&self, params: FindGameParams) -> Result<FindGameResult, ManagerError> {
        let token = random_token(JOIN_TOKEN_BYTES);

        let (worker_id, game_id, created) = {
            let mut table = self.table.lock();
            let candidates: Vec<GameData> = table.workers.values().map(WorkerHandle::candidate).collect();
            let picked = select_oldest_joinable(&candidates, &params)
                .and_then(|data| table.by_game.get(&data.id).copied());

            match picked.and_then(|worker_id| table.workers.get_mut(&worker_id)) {
                Some(worker) => {
                    worker.add_join_token(token.clone(), &params);
                    let game_id = worker.data.id.clone();
                    if worker.created_waiters.is_empty() {
                        return Ok(FindGameResult {
                            game_id,
                            token,
                            route: Self::route(worker.id),
                        });
                    }
                    debug!(worker_id = worker.id, match_id = %game_id, "Waiting on initializing game");
                    let (tx, rx) = oneshot::channel();
                    worker.created_waiters.push(tx);
                    (worker.id, game_id, rx)
                }
                None => self.place_new_game(&mut table, &params, token.clone())?,
            }
        };

        match timeout(self.config.find_game_timeout(), created).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(ManagerError::WorkerGone),
            Err(_) => {
                warn!(worker_id, match_id = %game_id, "Game did not come up in time");
                return Err(ManagerError::Timeout);
            }
        }

        let running = self
            .table
            .lock()
            .workers
            .get(&worker_id)
            .is_some_and(|w| w.data.id == game_id);
        if !running {
            return Err(ManagerError::WorkerGone);
        }
        Ok(FindGameResult {
            game_id,
            token,
            route: Self::route(worker_id),
        })
    }

    fn can_accept(&self, route: &str, game_id: &str) -> bool {
        let Some(worker_id) = Self::parse_route(route) else {
            return false;
        };
        self.table
            .lock()
            .worker_for_game(game_id)
            .is_some_and(|w| w.id == worker_id && !w.data.stopped)
    }

    fn on_open(&self, socket_id: Uuid, game_id: &str) -> bool {
        let table = self.table.lock();
        let Some(worker) = table.worker_for_game(game_id).filter(|w| !w.data.stopped) else {
            return false;
        };
        self.socket_workers.insert(socket_id, worker.id);
        worker.send(ThreadMsg::SocketOpen { socket_id });
        true
    }

    fn on_msg(&self, socket_id: Uuid, data: Bytes) {
        let Some(worker_id) = self.socket_workers.get(&socket_id).map(|w| *w.value()) else {
            return;
        };
        if let Some(worker) = self.table.lock().workers.get(&worker_id) {
            worker.send(ThreadMsg::SocketMsg {
                msgs: vec![SocketFrame { socket_id, data }],
            });
        }
    }

    fn on_close(&self, socket_id: Uuid) {
        let Some((_, worker_id)) = self.socket_workers.remove(&socket_id) else {
            return;
        };
        if let Some(worker) = self.table.lock().workers.get(&worker_id) {
            worker.send(ThreadMsg::SocketClose { socket_id });
        }
    }

    async fn shutdown(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut table = self.table.lock();
            table.by_game.clear();
            table
                .workers
                .drain()
                .filter_map(|(_, mut worker)| {
                    worker.send(ThreadMsg::Shutdown);
                    worker.thread.take()
                })
                .collect()
        };

        let count = threads.len();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        });
        if joined.await.is_err() {
            warn!("Failed to join worker threads");
        }

        for entry in self.socket_workers.iter() {
            self.sockets.close(*entry.key());
        }
        self.socket_workers.clear();
        info!(workers = count, "Worker manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::TeamMode;

    fn manager(pool_size: u16) -> Arc<GameThreadManager> {
        let config = Config {
            worker_pool_size: pool_size,
            find_game_timeout_secs: 120,
            ..Config::default()
        };
        let mut settings = WorkerSettings::from_config(&config);
        settings.game.seed = Some(11);
        let manager = Arc::new(GameThreadManager::with_settings(
            Arc::new(config),
            settings,
            Arc::new(SocketRegistry::new()),
        ));
        manager.start();
        manager
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
    fn test_route_round_trip() {
        assert_eq!(GameThreadManager::route(8002), "play_8002");
        assert_eq!(GameThreadManager::parse_route("play_8002"), Some(8002));
        assert_eq!(GameThreadManager::parse_route("play"), None);
        assert_eq!(GameThreadManager::parse_route("play_x"), None);
    }

    #[tokio::test]
    async fn test_find_game_spawns_worker_once() {
        let manager = manager(4);
        let first = manager.find_game(params()).await.unwrap();
        let second = manager.find_game(params()).await.unwrap();

        assert_eq!(first.game_id, second.game_id);
        assert_eq!(first.route, second.route);
        assert!(first.route.starts_with(ROUTE_PREFIX));
        assert!(manager.can_accept(&first.route, &first.game_id));
        assert!(!manager.can_accept("play_1", &first.game_id));
        assert_eq!(manager.game_count(), 1);

        manager.shutdown().await;
        assert_eq!(manager.game_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_initializing_worker() {
        let manager = manager(4);
        let (a, b, c) = tokio::join!(
            manager.find_game(params()),
            manager.find_game(params()),
            manager.find_game(params()),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(a.game_id, b.game_id);
        assert_eq!(a.game_id, c.game_id);
        assert_eq!(a.route, c.route);
        assert_eq!(manager.game_count(), 1);
        assert_eq!(manager.table.lock().workers.len(), 1);

        let max_players = map_def("main").unwrap().game_mode.max_players;
        let data = manager.get_by_id(&a.game_id).unwrap();
        assert_eq!(data.available_slots, max_players - 3);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let manager = manager(0);
        assert!(matches!(
            manager.find_game(params()).await,
            Err(ManagerError::NoFreeWorker)
        ));
    }

    #[tokio::test]
    async fn test_stopped_worker_is_reused() {
        let manager = manager(1);
        let first = manager.find_game(params()).await.unwrap();
        let worker_id = GameThreadManager::parse_route(&first.route).unwrap();

        // report the match as over without waiting for the worker
        let mut data = manager.get_by_id(&first.game_id).unwrap();
        data.stopped = true;
        data.can_join = false;
        manager.handle_worker_msg(worker_id, ThreadMsg::UpdateData(data));
        assert!(!manager.can_accept(&first.route, &first.game_id));

        let second = manager.find_game(params()).await.unwrap();
        assert_ne!(second.game_id, first.game_id);
        assert_eq!(second.route, first.route);
        assert!(manager.get_by_id(&first.game_id).is_none());

        manager.shutdown().await;
    }
}
