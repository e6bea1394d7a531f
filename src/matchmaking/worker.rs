//! Game worker: one match on its own OS thread with its own runtime
//!
//! The worker and its manager share nothing but two channels carrying
//! [`ThreadMsg`]. The manager sends a heartbeat every few seconds; a worker
//! that hears nothing for too long shuts itself down.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::game::{Game, GameConfig, GameData, GameSettings, Outgoing};
use crate::util::time::{PerfLog, SyncGate, Ticker, Timer};

/// One socket frame crossing the worker boundary
#[derive(Debug, Clone, PartialEq)]
pub struct SocketFrame {
    pub socket_id: Uuid,
    pub data: Bytes,
}

/// Messages between the manager and a worker
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadMsg {
    /// Manager -> worker: generate a new match
    Create { id: String, config: GameConfig },
    /// Worker -> manager: the match is ready for joins
    Created(GameData),
    /// Either way: liveness only
    KeepAlive,
    /// Worker -> manager: fresh summary of the match
    UpdateData(GameData),
    /// Manager -> worker: reserve seats for a find-game response
    AddJoinToken {
        token: String,
        auto_fill: bool,
        player_count: u8,
    },
    /// Manager -> worker: a socket was upgraded for this match
    SocketOpen { socket_id: Uuid },
    /// Batched socket frames, inbound or outbound
    SocketMsg { msgs: Vec<SocketFrame> },
    /// Manager -> worker: the socket closed. Worker -> manager: close it.
    SocketClose { socket_id: Uuid },
    /// Manager -> worker: stop the match and exit
    Shutdown,
}

/// Timing knobs a worker runs with
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub game: GameSettings,
    pub game_tps: u32,
    pub net_sync_tps: u32,
    pub keepalive: Duration,
    pub timeout: Duration,
    pub perf_log_secs: u64,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            game: GameSettings::from_config(config),
            game_tps: config.game_tps,
            net_sync_tps: config.net_sync_tps,
            keepalive: config.keepalive(),
            timeout: config.worker_timeout(),
            perf_log_secs: config.perf_log_secs,
        }
    }
}

/// Spawn a worker thread. Messages it sends are tagged with `worker_id`.
pub fn spawn_worker(
    worker_id: u16,
    settings: WorkerSettings,
    to_manager: UnboundedSender<(u16, ThreadMsg)>,
) -> std::io::Result<(UnboundedSender<ThreadMsg>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = thread::Builder::new()
        .name(format!("game-worker-{worker_id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to build worker runtime");
                    return;
                }
            };
            runtime.block_on(Worker::new(worker_id, settings, rx, to_manager).run());
        })?;
    Ok((tx, handle))
}

struct Worker {
    worker_id: u16,
    settings: WorkerSettings,
    inbox: UnboundedReceiver<ThreadMsg>,
    outbox: UnboundedSender<(u16, ThreadMsg)>,
    game: Option<Game>,
    sync_gate: SyncGate,
    last_msg: Instant,
}

impl Worker {
    fn new(
        worker_id: u16,
        settings: WorkerSettings,
        inbox: UnboundedReceiver<ThreadMsg>,
        outbox: UnboundedSender<(u16, ThreadMsg)>,
    ) -> Self {
        let sync_gate = SyncGate::new(settings.net_sync_tps);
        Self {
            worker_id,
            settings,
            inbox,
            outbox,
            game: None,
            sync_gate,
            last_msg: Instant::now(),
        }
    }

    async fn run(mut self) {
        info!(worker_id = self.worker_id, "Worker started");

        let mut ticker = Ticker::new(self.settings.game_tps);
        let mut heartbeat = interval(self.settings.keepalive);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut perf = PerfLog::new(self.settings.perf_log_secs);

        loop {
            // queued manager messages are applied before the next tick or report
            tokio::select! {
                biased;
                msg = self.inbox.recv() => match msg {
                    Some(ThreadMsg::Shutdown) | None => break,
                    Some(msg) => {
                        self.last_msg = Instant::now();
                        self.handle(msg);
                    }
                },
                dt = ticker.tick() => {
                    let timer = Timer::new();
                    self.step(dt);
                    perf.record(timer.elapsed());
                    if let Some(report) = perf.report(Instant::now()) {
                        info!(
                            worker_id = self.worker_id,
                            ticks = report.ticks,
                            avg_ms = format!("{:.2}", report.avg_ms),
                            max_ms = format!("{:.2}", report.max_ms),
                            "Tick performance"
                        );
                    }
                }
                _ = heartbeat.tick() => {
                    if self.last_msg.elapsed() > self.settings.timeout {
                        warn!(worker_id = self.worker_id, "No message from manager, exiting");
                        break;
                    }
                    self.report();
                }
            }
        }

        if let Some(game) = self.game.as_mut() {
            game.stop("server_shutdown");
        }
        self.flush();
        info!(worker_id = self.worker_id, "Worker stopped");
    }

    fn send(&self, msg: ThreadMsg) {
        if self.outbox.send((self.worker_id, msg)).is_err() {
            debug!(worker_id = self.worker_id, "Manager gone");
        }
    }

    fn handle(&mut self, msg: ThreadMsg) {
        match msg {
            ThreadMsg::Create { id, config } => self.create(id, config),
            ThreadMsg::AddJoinToken {
                token,
                auto_fill,
                player_count,
            } => {
                let Some(game) = self.game.as_mut() else {
                    warn!(worker_id = self.worker_id, "Join token for idle worker");
                    return;
                };
                if let Err(e) = game.add_join_token(token, auto_fill, player_count) {
                    warn!(worker_id = self.worker_id, match_id = %game.id, error = %e, "Join token rejected");
                }
            }
            ThreadMsg::SocketOpen { socket_id } => {
                if !self.game.as_ref().is_some_and(|g| !g.is_stopped()) {
                    self.send(ThreadMsg::SocketClose { socket_id });
                }
            }
            ThreadMsg::SocketMsg { msgs } => {
                if let Some(game) = self.game.as_mut() {
                    for frame in msgs {
                        game.handle_msg(frame.socket_id, &frame.data);
                    }
                }
                self.flush();
            }
            ThreadMsg::SocketClose { socket_id } => {
                if let Some(game) = self.game.as_mut() {
                    game.handle_socket_close(socket_id);
                }
                self.flush();
            }
            ThreadMsg::KeepAlive => {}
            ThreadMsg::Created(_) | ThreadMsg::UpdateData(_) | ThreadMsg::Shutdown => {
                debug!(worker_id = self.worker_id, "Unexpected message from manager");
            }
        }
    }

    /// Replace whatever match ran here before with a fresh one. The manager
    /// only reuses workers it has seen stop.
    fn create(&mut self, id: String, config: GameConfig) {
        if let Some(old) = self.game.as_mut() {
            if !old.is_stopped() {
                warn!(worker_id = self.worker_id, match_id = %old.id, "Replacing a running game");
            }
            old.stop("game_over");
            self.flush();
        }

        let timer = Timer::new();
        match Game::new(id, config, self.settings.game.clone()) {
            Ok(game) => {
                info!(
                    worker_id = self.worker_id,
                    match_id = %game.id,
                    elapsed_ms = timer.elapsed_ms(),
                    "Game created"
                );
                self.send(ThreadMsg::Created(game.summary()));
                self.game = Some(game);
                self.sync_gate = SyncGate::new(self.settings.net_sync_tps);
            }
            Err(e) => {
                error!(worker_id = self.worker_id, error = %e, "Failed to create game");
                self.game = None;
            }
        }
    }

    fn step(&mut self, dt: f32) {
        let Some(game) = self.game.as_mut() else {
            return;
        };
        if game.is_stopped() {
            return;
        }

        game.tick(dt);
        if self.sync_gate.should_sync(Instant::now()) || game.is_stopped() {
            game.net_sync();
        }
        let stopped = game.is_stopped();
        if stopped {
            game.stop("game_over");
        }
        self.flush();
        if stopped {
            self.report();
        }
    }

    /// Report the match summary, or a bare heartbeat when idle
    fn report(&self) {
        match self.game.as_ref() {
            Some(game) => self.send(ThreadMsg::UpdateData(game.summary())),
            None => self.send(ThreadMsg::KeepAlive),
        }
    }

    /// Forward queued frames, batching consecutive sends
    fn flush(&mut self) {
        let Some(game) = self.game.as_mut() else {
            return;
        };
        for msg in batch_outgoing(game.take_outgoing()) {
            self.send(msg);
        }
    }
}

/// Group outgoing frames into `SocketMsg` batches. A close ends the current
/// batch so it is delivered after every frame queued before it.
fn batch_outgoing(outgoing: Vec<Outgoing>) -> Vec<ThreadMsg> {
    let mut out = Vec::new();
    let mut batch = Vec::new();
    for msg in outgoing {
        match msg {
            Outgoing::Send { socket_id, data } => batch.push(SocketFrame { socket_id, data }),
            Outgoing::Close { socket_id } => {
                if !batch.is_empty() {
                    out.push(ThreadMsg::SocketMsg {
                        msgs: std::mem::take(&mut batch),
                    });
                }
                out.push(ThreadMsg::SocketClose { socket_id });
            }
        }
    }
    if !batch.is_empty() {
        out.push(ThreadMsg::SocketMsg { msgs: batch });
    }
    out
}
