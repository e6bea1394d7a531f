//! Match state and authoritative tick

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DebugConfig};
use crate::defs::{map_def, MapDef, TeamMode};
use crate::util::rng::SeededRng;
use crate::util::time::unix_millis;
use crate::ws::protocol::{
    ClientMsg, GameOverMsg, JoinedMsg, KillLeaderMsg, KillMsg, ServerMsg, PROTOCOL_VERSION,
};
use crate::ws::stream::MsgWriter;

use super::combat::{CombatSystem, HitTarget, WeaponStats};
use super::entity::{Airdrop, Entity, EntityId, EntityKind, AIRDROP_RADIUS, LAYER_GROUND};
use super::gas::{Gas, GasUpdate};
use super::map::{spawn_decal, spawn_loot, spawn_obstacle, GameMap, MapError, SpawnRequest};
use super::physics::PhysicsSystem;
use super::player::{Group, InputState, JoinToken, Player, Team, KILL_LEADER_MIN_KILLS};
use super::sync::{GlobalState, NetSync};
use super::world::{IdsExhausted, World};

/// Gas starts once this many groups (or faction teams) are in
const MIN_SIDES_TO_START: usize = 2;
const DEATH_LOOT_TIER: &str = "tier_1";
const DEATH_DECAL: &str = "decal_blood_01";
const AIRDROP_CRATE: &str = "airdrop_crate_01";
/// Seconds between an airdrop appearing and its crate landing
const AIRDROP_FALL_TIME: f32 = 8.0;
/// Airdrops land within this fraction of the next safe zone
const AIRDROP_ZONE_FRACTION: f32 = 0.8;
const MAX_NAME_LEN: usize = 16;
const DEFAULT_NAME: &str = "Player";
/// Keeps gameplay rolls independent from map generation for the same seed
const GAMEPLAY_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    /// Map generated, waiting for enough players to start the gas
    Initializing,
    /// Gas running
    Running,
    /// Terminal
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Ids(#[from] IdsExhausted),
    #[error("game is not accepting players")]
    NotJoinable,
    #[error("not enough free slots")]
    Full,
    #[error("group ids exhausted")]
    GroupsExhausted,
}

/// What a match is created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameConfig {
    pub map_name: String,
    pub team_mode: TeamMode,
}

/// Tunables shared by every match of a server
#[derive(Debug, Clone)]
pub struct GameSettings {
    pub join_token_ttl: Duration,
    /// A match nobody is connected to (or on the way to) stops after this long
    pub empty_timeout: Duration,
    pub debug: DebugConfig,
    /// Random when unset
    pub seed: Option<u64>,
}

impl GameSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            join_token_ttl: Duration::from_secs(config.join_token_ttl_secs),
            empty_timeout: Duration::from_secs(config.empty_game_timeout_secs),
            debug: config.debug.clone(),
            seed: None,
        }
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Summary the lifecycle manager matches find-game requests against
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameData {
    pub id: String,
    pub map_name: String,
    pub team_mode: TeamMode,
    pub can_join: bool,
    pub alive_count: usize,
    pub available_slots: usize,
    /// Unix millis
    pub started_time: u64,
    pub stopped: bool,
}

/// Frames produced by the match for the socket gateway
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send { socket_id: Uuid, data: Bytes },
    Close { socket_id: Uuid },
}

/// One authoritative match
pub struct Game {
    pub id: String,
    pub config: GameConfig,
    settings: GameSettings,
    def: &'static MapDef,
    pub phase: GamePhase,
    pub map: GameMap,
    pub world: World,
    pub gas: Gas,
    rng: SeededRng,
    pub tick_count: u64,
    pub started_time: u64,
    empty_since: Option<Instant>,
    join_tokens: HashMap<String, JoinToken>,
    sockets: HashMap<Uuid, EntityId>,
    groups: BTreeMap<u8, Group>,
    teams: Vec<Team>,
    next_group_id: u8,
    weapon: WeaponStats,
    kill_leader: Option<EntityId>,
    kill_leader_dirty: bool,
    alive_dirty: bool,
    sync: NetSync,
    writer: MsgWriter,
    outgoing: Vec<Outgoing>,
}

impl Game {
    /// Generate the map and open the match for joins
    pub fn new(id: String, config: GameConfig, settings: GameSettings) -> Result<Self, GameError> {
        let def = map_def(&config.map_name).ok_or_else(|| MapError::UnknownMap(config.map_name.clone()))?;
        let seed = settings.seed.unwrap_or_else(rand::random);

        let (width, height) = GameMap::dimensions(def, config.team_mode);
        let mut world = World::new(width, height);
        let map = GameMap::generate(def, config.team_mode, seed, &mut world)?;
        let gas = Gas::new(&def.gas, width, height);
        let teams = if def.game_mode.faction_mode {
            (1..=2).map(|id| Team { id, players: Vec::new() }).collect()
        } else {
            Vec::new()
        };

        info!(
            match_id = %id,
            map = def.name,
            team_mode = ?config.team_mode,
            seed,
            objects = world.len(),
            "Game created"
        );

        Ok(Self {
            id,
            config,
            settings,
            def,
            phase: GamePhase::Initializing,
            map,
            world,
            gas,
            rng: SeededRng::new(seed ^ GAMEPLAY_SEED_SALT),
            tick_count: 0,
            started_time: unix_millis(),
            empty_since: None,
            join_tokens: HashMap::new(),
            sockets: HashMap::new(),
            groups: BTreeMap::new(),
            teams,
            next_group_id: 1,
            weapon: WeaponStats::default(),
            kill_leader: None,
            kill_leader_dirty: false,
            alive_dirty: false,
            sync: NetSync::new(),
            writer: MsgWriter::new(),
            outgoing: Vec::new(),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == GamePhase::Stopped
    }

    pub fn player(&self, id: EntityId) -> Option<&Player> {
        self.world.get(id).and_then(Entity::as_player)
    }

    fn player_mut(&mut self, id: EntityId) -> Option<&mut Player> {
        self.world.get_mut(id).and_then(Entity::as_player_mut)
    }

    /// Player a socket controls
    pub fn player_for_socket(&self, socket_id: &Uuid) -> Option<EntityId> {
        self.sockets.get(socket_id).copied()
    }

    pub fn alive_count(&self) -> usize {
        self.world
            .iter_kind(EntityKind::Player)
            .filter_map(Entity::as_player)
            .filter(|p| p.is_alive())
            .count()
    }

    pub fn connected_count(&self) -> usize {
        self.sockets.len()
    }

    /// Groups (faction teams in faction mode) with a living member
    pub fn alive_sides(&self) -> usize {
        let alive = |players: &[EntityId]| {
            players
                .iter()
                .any(|id| self.player(*id).map(Player::is_alive).unwrap_or(false))
        };
        if self.teams.is_empty() {
            self.groups.values().filter(|g| alive(&g.players)).count()
        } else {
            self.teams.iter().filter(|t| alive(&t.players)).count()
        }
    }

    fn reserved_slots(&self) -> usize {
        self.join_tokens.values().map(|t| t.remaining as usize).sum()
    }

    pub fn available_slots(&self) -> usize {
        self.def
            .game_mode
            .max_players
            .saturating_sub(self.world.count_of(EntityKind::Player) + self.reserved_slots())
    }

    pub fn can_join(&self) -> bool {
        self.phase != GamePhase::Stopped
            && self.gas.stage < self.def.game_mode.join_cutoff_stage
            && self.available_slots() > 0
    }

    pub fn summary(&self) -> GameData {
        GameData {
            id: self.id.clone(),
            map_name: self.config.map_name.clone(),
            team_mode: self.config.team_mode,
            can_join: self.can_join(),
            alive_count: self.alive_count(),
            available_slots: self.available_slots(),
            started_time: self.started_time,
            stopped: self.is_stopped(),
        }
    }

    /// Reserve `player_count` seats for the holders of `token`
    pub fn add_join_token(&mut self, token: String, auto_fill: bool, player_count: u8) -> Result<(), GameError> {
        if !self.can_join() {
            return Err(GameError::NotJoinable);
        }
        let player_count = player_count.clamp(1, self.config.team_mode.group_size());
        if self.available_slots() < player_count as usize {
            return Err(GameError::Full);
        }

        debug!(match_id = %self.id, player_count, auto_fill, "Join token added");
        self.join_tokens.insert(
            token.clone(),
            JoinToken {
                token,
                auto_fill,
                player_count,
                remaining: player_count,
                group_id: None,
                expires_at: Instant::now() + self.settings.join_token_ttl,
            },
        );
        Ok(())
    }

    /// Apply one binary frame from a socket. Malformed frames are dropped.
    pub fn handle_msg(&mut self, socket_id: Uuid, data: &[u8]) {
        let msg = match ClientMsg::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(match_id = %self.id, socket_id = %socket_id, error = %err, "Dropping malformed frame");
                return;
            }
        };

        match msg {
            ClientMsg::Join { protocol, token, name } => self.handle_join(socket_id, protocol, &token, &name),
            ClientMsg::Input { seq, input } => self.handle_input(socket_id, seq, input),
        }
    }

    fn handle_join(&mut self, socket_id: Uuid, protocol: u32, token: &str, name: &str) {
        if self.sockets.contains_key(&socket_id) {
            warn!(match_id = %self.id, socket_id = %socket_id, "Socket already joined");
            return;
        }
        if protocol != PROTOCOL_VERSION {
            self.disconnect(socket_id, "invalid_protocol");
            return;
        }
        if self.is_stopped() {
            self.disconnect(socket_id, "game_over");
            return;
        }

        let Some(mut join_token) = self.join_tokens.remove(token) else {
            warn!(match_id = %self.id, socket_id = %socket_id, "Join with unknown token");
            self.disconnect(socket_id, "invalid_token");
            return;
        };
        if join_token.is_expired(Instant::now()) {
            self.release_reservation(&join_token);
            self.disconnect(socket_id, "invalid_token");
            return;
        }

        let result = self.add_player(socket_id, &mut join_token, name);
        join_token.remaining -= 1;
        if join_token.remaining > 0 {
            self.join_tokens.insert(join_token.token.clone(), join_token);
        }

        match result {
            Ok(player_id) => self.on_player_joined(socket_id, player_id),
            Err(err) => {
                error!(match_id = %self.id, socket_id = %socket_id, error = %err, "Failed to add player");
                self.disconnect(socket_id, "server_error");
            }
        }
    }

    fn add_player(&mut self, socket_id: Uuid, join_token: &mut JoinToken, name: &str) -> Result<EntityId, GameError> {
        let group_id = self.assign_group(join_token)?;
        let team_id = self.assign_team(group_id);

        let anchor = self.groups.get(&group_id).and_then(|g| {
            g.players
                .iter()
                .filter_map(|id| self.player(*id))
                .find(|p| p.is_alive())
                .map(|p| p.pos)
        });
        let req = SpawnRequest {
            group_id: Some(group_id),
            team_id,
            anchor,
        };
        let gas = &self.gas;
        let pos = self
            .map
            .spawn_pos(&self.world, &mut self.rng, &req, &self.settings.debug, |p| gas.is_outside(p));

        let name = sanitize_name(name);
        let player_id = self
            .world
            .insert(|id| Entity::Player(Box::new(Player::new(id, socket_id, name, group_id, team_id, pos))))?;

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.players.push(player_id);
        }
        if let Some(team) = self.teams.iter_mut().find(|t| t.id == team_id) {
            team.players.push(player_id);
        }
        Ok(player_id)
    }

    /// Group for the next holder of `join_token`. The first holder picks (or
    /// opens) the group and reserves seats in it for the rest.
    fn assign_group(&mut self, join_token: &mut JoinToken) -> Result<u8, GameError> {
        if let Some(id) = join_token.group_id {
            if let Some(group) = self.groups.get_mut(&id) {
                group.reserved = group.reserved.saturating_sub(1);
            }
            return Ok(id);
        }

        let group_size = self.config.team_mode.group_size() as usize;
        let incoming = join_token.remaining as usize;
        let existing = if join_token.auto_fill {
            self.groups
                .values()
                .filter(|g| g.auto_fill && g.size() + incoming <= group_size)
                .find(|g| {
                    g.players
                        .iter()
                        .all(|id| self.player(*id).map(Player::is_alive).unwrap_or(false))
                })
                .map(|g| g.id)
        } else {
            None
        };

        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.next_group_id;
                if id == u8::MAX {
                    return Err(GameError::GroupsExhausted);
                }
                self.next_group_id += 1;
                self.groups.insert(id, Group::new(id, join_token.auto_fill));
                id
            }
        };

        if let Some(group) = self.groups.get_mut(&id) {
            group.reserved += incoming - 1;
        }
        join_token.group_id = Some(id);
        Ok(id)
    }

    /// Faction team for a new member of `group_id`: the group's team, else the smaller one
    fn assign_team(&self, group_id: u8) -> u8 {
        if self.teams.is_empty() {
            return 0;
        }
        let group_team = self
            .groups
            .get(&group_id)
            .and_then(|g| g.players.first())
            .and_then(|id| self.player(*id))
            .map(|p| p.team_id);

        group_team
            .or_else(|| self.teams.iter().min_by_key(|t| t.players.len()).map(|t| t.id))
            .unwrap_or(1)
    }

    fn on_player_joined(&mut self, socket_id: Uuid, player_id: EntityId) {
        self.sockets.insert(socket_id, player_id);
        self.empty_since = None;
        self.alive_dirty = true;

        let Some(player) = self.player(player_id) else {
            error!(match_id = %self.id, player_id, "Joined player missing");
            return;
        };
        let joined = JoinedMsg {
            player_id,
            group_id: player.group_id,
            team_id: player.team_id,
            team_size: self.config.team_mode.group_size(),
        };
        info!(
            match_id = %self.id,
            socket_id = %socket_id,
            player_id,
            group_id = joined.group_id,
            alive = self.alive_count(),
            "Player joined"
        );

        self.send(socket_id, &ServerMsg::Joined(joined));
        ServerMsg::Map(&self.map).encode(&mut self.writer);
        let data = self.writer.take();
        self.outgoing.push(Outgoing::Send { socket_id, data });

        if self.phase == GamePhase::Initializing && self.alive_sides() >= MIN_SIDES_TO_START {
            self.start();
        }
    }

    fn handle_input(&mut self, socket_id: Uuid, seq: u32, input: InputState) {
        let Some(player_id) = self.player_for_socket(&socket_id) else {
            debug!(match_id = %self.id, socket_id = %socket_id, "Input before join");
            return;
        };
        if let Some(player) = self.player_mut(player_id) {
            if player.is_alive() && seq > player.last_input_seq {
                player.last_input_seq = seq;
                player.input = input;
            }
        }
    }

    /// The socket is gone; its player is out of the match
    pub fn handle_socket_close(&mut self, socket_id: Uuid) {
        let Some(player_id) = self.sockets.remove(&socket_id) else {
            return;
        };
        if let Some(player) = self.player_mut(player_id) {
            player.disconnected = true;
            player.input = InputState::default();
        }
        info!(match_id = %self.id, socket_id = %socket_id, player_id, "Player left");
        self.kill_player(player_id, None);
    }

    fn start(&mut self) {
        self.phase = GamePhase::Running;
        let update = self.gas.start(&mut self.rng);
        info!(match_id = %self.id, alive = self.alive_count(), "Game started");
        self.apply_gas_update(update);
    }

    /// Advance the simulation by `dt` seconds
    pub fn tick(&mut self, dt: f32) {
        if self.is_stopped() {
            return;
        }
        self.tick_count += 1;
        let now = Instant::now();

        self.expire_tokens(now);
        self.update_players(dt);
        self.update_projectiles(dt);
        if self.phase == GamePhase::Running {
            self.update_gas(dt);
        }
        self.update_airdrops(dt);
        self.map.update_occupancy(&mut self.world);
        self.check_game_over();
        self.check_empty(now);
    }

    fn expire_tokens(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .join_tokens
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.token.clone())
            .collect();
        for token in expired {
            if let Some(join_token) = self.join_tokens.remove(&token) {
                debug!(match_id = %self.id, remaining = join_token.remaining, "Join token expired");
                self.release_reservation(&join_token);
            }
        }
    }

    fn release_reservation(&mut self, join_token: &JoinToken) {
        if let Some(group) = join_token.group_id.and_then(|id| self.groups.get_mut(&id)) {
            group.reserved = group.reserved.saturating_sub(join_token.remaining as usize);
        }
    }

    fn update_players(&mut self, dt: f32) {
        let ids: Vec<EntityId> = self.world.ids_of(EntityKind::Player).collect();
        for id in ids {
            let Some(player) = self.player(id).filter(|p| p.is_alive()) else {
                continue;
            };
            let pos = PhysicsSystem::move_player(&self.world, &self.map, player, dt);
            let dir = player.input.aim.normalize_or(player.dir);
            let cooldown = CombatSystem::update_cooldown(player.weapon_cooldown, dt);
            let shooter = (player.input.shoot && CombatSystem::can_fire(cooldown)).then(|| Player {
                pos,
                dir,
                known: Default::default(),
                ..player.clone()
            });
            let changed = pos != player.pos || dir != player.dir;

            if let Some(player) = self.player_mut(id) {
                player.pos = pos;
                player.dir = dir;
                player.weapon_cooldown = cooldown;
            }
            if changed {
                self.world.refresh(id);
                self.world.mark_part_dirty(id);
            }

            if let Some(shooter) = shooter {
                match CombatSystem::fire(&mut self.world, &shooter, &self.weapon) {
                    Ok(_) => {
                        let cooldown = self.weapon.cooldown;
                        if let Some(player) = self.player_mut(id) {
                            player.weapon_cooldown = cooldown;
                        }
                    }
                    Err(err) => warn!(match_id = %self.id, player_id = id, error = %err, "Shot dropped"),
                }
            }
        }
    }

    fn update_projectiles(&mut self, dt: f32) {
        let step = CombatSystem::step_projectiles(&mut self.world, dt);
        for id in step.expired {
            self.world.remove(id);
        }
        for hit in step.hits {
            self.world.remove(hit.projectile);
            match hit.target {
                HitTarget::Player(target) => self.damage_player(target, hit.damage, Some(hit.shooter)),
                HitTarget::Obstacle(target) => self.damage_obstacle(target, hit.damage),
            }
        }
    }

    fn damage_player(&mut self, target: EntityId, damage: f32, source: Option<EntityId>) {
        let Some(player) = self.player_mut(target).filter(|p| p.is_alive()) else {
            return;
        };
        let (health, killed) = CombatSystem::apply_damage(player.health, damage);
        player.health = health;

        if let Some(shooter) = source.and_then(|id| self.player_mut(id)) {
            shooter.damage_dealt += damage;
        }
        if killed {
            self.kill_player(target, source);
        }
    }

    fn damage_obstacle(&mut self, target: EntityId, damage: f32) {
        let Some(obstacle) = self.world.get_mut(target).and_then(Entity::as_obstacle_mut) else {
            return;
        };
        if obstacle.dead || !obstacle.destructible {
            return;
        }
        let (health, destroyed) = CombatSystem::apply_damage(obstacle.health, damage);
        obstacle.health = health;
        let (pos, layer, loot, type_name) = (obstacle.pos, obstacle.layer, obstacle.loot, obstacle.type_name);

        if !destroyed {
            self.world.mark_part_dirty(target);
            return;
        }
        self.world.remove(target);
        if let Some(tier) = loot {
            if let Err(err) = spawn_loot(&mut self.world, tier, pos, layer) {
                warn!(match_id = %self.id, error = %err, "Obstacle loot dropped");
            }
        }
        debug!(match_id = %self.id, obstacle = type_name, "Obstacle destroyed");
    }

    fn kill_player(&mut self, victim: EntityId, killer: Option<EntityId>) {
        let Some(player) = self.player_mut(victim).filter(|p| p.is_alive()) else {
            return;
        };
        player.dead = true;
        player.health = 0.0;
        player.input = InputState::default();
        let (pos, layer, socket_id, kills, damage_dealt, group_id) = (
            player.pos,
            player.layer,
            player.socket_id,
            player.kills,
            player.damage_dealt,
            player.group_id,
        );
        self.world.mark_full_dirty(victim);

        let killer = killer.filter(|k| *k != victim);
        let mut killer_kills = 0;
        if let Some(k) = killer.and_then(|id| self.player_mut(id)) {
            k.kills += 1;
            killer_kills = k.kills;
        }

        if let Err(err) = spawn_loot(&mut self.world, DEATH_LOOT_TIER, pos, layer) {
            warn!(match_id = %self.id, error = %err, "Death loot dropped");
        }
        if let Err(err) = spawn_decal(&mut self.world, DEATH_DECAL, pos, layer) {
            warn!(match_id = %self.id, error = %err, "Death decal dropped");
        }

        self.alive_dirty = true;
        self.kill_leader_dirty = true;
        self.update_kill_leader();

        self.broadcast(&ServerMsg::Kill(KillMsg {
            victim,
            killer: killer.unwrap_or(0),
            killer_kills,
        }));

        if self.sockets.contains_key(&socket_id) {
            let group_alive = self
                .groups
                .get(&group_id)
                .map(|g| g.players.iter().any(|id| self.player(*id).map(Player::is_alive).unwrap_or(false)))
                .unwrap_or(false);
            let rank = self.alive_sides() + usize::from(!group_alive);
            self.send(
                socket_id,
                &ServerMsg::GameOver(GameOverMsg {
                    rank: rank.min(u8::MAX as usize) as u8,
                    won: false,
                    kills,
                    damage_dealt,
                }),
            );
        }

        info!(match_id = %self.id, victim, killer = ?killer, alive = self.alive_count(), "Player killed");
    }

    /// Living player with the most kills, at least the minimum. Ties keep the holder.
    fn update_kill_leader(&mut self) {
        let best = self
            .world
            .iter_kind(EntityKind::Player)
            .filter_map(Entity::as_player)
            .filter(|p| p.is_alive() && p.kills >= KILL_LEADER_MIN_KILLS)
            .map(|p| p.kills)
            .max();

        let holder_keeps = self
            .kill_leader
            .and_then(|id| self.player(id))
            .map(|p| p.is_alive() && Some(p.kills) == best)
            .unwrap_or(false);
        if holder_keeps {
            return;
        }

        let leader = best.and_then(|kills| {
            self.world
                .iter_kind(EntityKind::Player)
                .filter_map(Entity::as_player)
                .find(|p| p.is_alive() && p.kills == kills)
                .map(|p| p.id)
        });
        if leader != self.kill_leader {
            debug!(match_id = %self.id, leader = ?leader, "Kill leader changed");
            self.kill_leader = leader;
        }
    }

    pub fn kill_leader(&self) -> Option<EntityId> {
        self.kill_leader
    }

    fn update_gas(&mut self, dt: f32) {
        let update = self.gas.update(dt, &mut self.rng);
        self.apply_gas_update(update);

        let damage = CombatSystem::gas_damage(self.gas.damage, dt);
        if damage <= 0.0 {
            return;
        }
        let victims: Vec<EntityId> = self
            .world
            .iter_kind(EntityKind::Player)
            .filter_map(Entity::as_player)
            .filter(|p| p.is_alive() && self.gas.is_outside(p.pos))
            .map(|p| p.id)
            .collect();
        for id in victims {
            self.damage_player(id, damage, None);
        }
    }

    fn apply_gas_update(&mut self, update: GasUpdate) {
        if update.stage_changed {
            debug!(match_id = %self.id, stage = self.gas.stage, mode = ?self.gas.mode, "Gas stage");
        }
        if update.airdrop {
            self.spawn_airdrop();
        }
    }

    fn spawn_airdrop(&mut self) {
        let offset = self.rng.point_in_circle(self.gas.rad_new * AIRDROP_ZONE_FRACTION);
        let pos = self.map.clamp_to_bounds(self.gas.pos_new + offset, AIRDROP_RADIUS);
        let result = self.world.insert(|id| {
            Entity::Airdrop(Airdrop {
                id,
                pos,
                fall_time: AIRDROP_FALL_TIME,
                landed: false,
            })
        });
        match result {
            Ok(id) => info!(match_id = %self.id, airdrop = id, x = pos.x, y = pos.y, "Airdrop incoming"),
            Err(err) => warn!(match_id = %self.id, error = %err, "Airdrop dropped"),
        }
    }

    fn update_airdrops(&mut self, dt: f32) {
        let ids: Vec<EntityId> = self.world.ids_of(EntityKind::Airdrop).collect();
        for id in ids {
            let Some(airdrop) = self.world.get_mut(id).and_then(Entity::as_airdrop_mut) else {
                continue;
            };
            airdrop.fall_time -= dt;
            let landed = (airdrop.fall_time <= 0.0).then(|| {
                airdrop.landed = true;
                airdrop.pos
            });
            self.world.mark_part_dirty(id);

            if let Some(pos) = landed {
                self.world.remove(id);
                match spawn_obstacle(&mut self.world, AIRDROP_CRATE, pos, LAYER_GROUND) {
                    Ok(Some(_)) => debug!(match_id = %self.id, "Airdrop landed"),
                    Ok(None) => error!(match_id = %self.id, crate_type = AIRDROP_CRATE, "Unknown airdrop crate"),
                    Err(err) => warn!(match_id = %self.id, error = %err, "Airdrop crate dropped"),
                }
            }
        }
    }

    fn check_game_over(&mut self) {
        if self.phase != GamePhase::Running || self.alive_sides() > 1 {
            return;
        }

        let winners: Vec<(Uuid, u32, f32)> = self
            .sockets
            .iter()
            .filter_map(|(socket_id, id)| self.player(*id).map(|p| (*socket_id, p)))
            .filter(|(_, p)| p.is_alive())
            .map(|(socket_id, p)| (socket_id, p.kills, p.damage_dealt))
            .collect();
        for (socket_id, kills, damage_dealt) in &winners {
            self.send(
                *socket_id,
                &ServerMsg::GameOver(GameOverMsg {
                    rank: 1,
                    won: true,
                    kills: *kills,
                    damage_dealt: *damage_dealt,
                }),
            );
        }

        self.phase = GamePhase::Stopped;
        info!(match_id = %self.id, winners = winners.len(), ticks = self.tick_count, "Game over");
    }

    fn check_empty(&mut self, now: Instant) {
        if !self.sockets.is_empty() || !self.join_tokens.is_empty() {
            self.empty_since = None;
            return;
        }
        let since = *self.empty_since.get_or_insert(now);
        if now.duration_since(since) >= self.settings.empty_timeout {
            info!(match_id = %self.id, "Game empty, stopping");
            self.phase = GamePhase::Stopped;
        }
    }

    /// Queue one update frame per connected player with everything that
    /// changed since the previous sync
    pub fn net_sync(&mut self) {
        let frame = self.world.take_dirty();
        let leader = self.kill_leader.and_then(|id| self.player(id)).map(|p| (p.id, p.kills));
        let globals = GlobalState {
            gas: &self.gas,
            gas_dirty: self.gas.dirty,
            alive_count: self.alive_count().min(u8::MAX as usize) as u8,
            alive_dirty: self.alive_dirty,
            kill_leader: KillLeaderMsg {
                player_id: leader.map(|l| l.0).unwrap_or(0),
                kills: leader.map(|l| l.1).unwrap_or(0),
            },
            kill_leader_dirty: self.kill_leader_dirty,
        };

        let targets: Vec<(Uuid, EntityId)> = self.sockets.iter().map(|(s, p)| (*s, *p)).collect();
        for (socket_id, player_id) in targets {
            match self.sync.player_update(&mut self.world, player_id, &frame, &globals) {
                Some(data) => self.outgoing.push(Outgoing::Send { socket_id, data }),
                None => error!(match_id = %self.id, socket_id = %socket_id, player_id, "Socket without player"),
            }
        }

        self.gas.dirty = false;
        self.alive_dirty = false;
        self.kill_leader_dirty = false;
    }

    /// Frames produced since the last call, in production order
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }

    /// End the match and close every socket
    pub fn stop(&mut self, reason: &str) {
        let sockets: Vec<Uuid> = self.sockets.drain().map(|(s, _)| s).collect();
        for socket_id in sockets {
            self.disconnect(socket_id, reason);
        }
        if self.phase != GamePhase::Stopped {
            info!(match_id = %self.id, reason, "Game stopped");
        }
        self.phase = GamePhase::Stopped;
    }

    fn send(&mut self, socket_id: Uuid, msg: &ServerMsg<'_>) {
        msg.encode(&mut self.writer);
        let data = self.writer.take();
        self.outgoing.push(Outgoing::Send { socket_id, data });
    }

    fn broadcast(&mut self, msg: &ServerMsg<'_>) {
        msg.encode(&mut self.writer);
        let data = self.writer.take();
        for socket_id in self.sockets.keys() {
            self.outgoing.push(Outgoing::Send {
                socket_id: *socket_id,
                data: data.clone(),
            });
        }
    }

    fn disconnect(&mut self, socket_id: Uuid, reason: &str) {
        self.send(socket_id, &ServerMsg::Disconnect { reason });
        self.outgoing.push(Outgoing::Close { socket_id });
    }
}

/// Trimmed, length-limited display name
fn sanitize_name(name: &str) -> String {
    let name: String = name.trim().chars().filter(|c| !c.is_control()).take(MAX_NAME_LEN).collect();
    if name.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnMode;
    use crate::ws::protocol::{peek_type, MsgType};
    use crate::ws::stream::MsgReader;

    fn game(team_mode: TeamMode) -> Game {
        let settings = GameSettings {
            seed: Some(42),
            ..GameSettings::default()
        };
        Game::new(
            "test".into(),
            GameConfig {
                map_name: "main".into(),
                team_mode,
            },
            settings,
        )
        .unwrap()
    }

    fn join_frame(token: &str) -> Vec<u8> {
        let mut w = MsgWriter::new();
        ClientMsg::Join {
            protocol: PROTOCOL_VERSION,
            token: token.into(),
            name: "  tester ".into(),
        }
        .encode(&mut w);
        w.take().to_vec()
    }

    fn join(game: &mut Game, token: &str) -> (Uuid, EntityId) {
        let socket = Uuid::new_v4();
        game.handle_msg(socket, &join_frame(token));
        let id = game.player_for_socket(&socket).expect("joined");
        (socket, id)
    }

    fn join_solo(game: &mut Game, token: &str) -> (Uuid, EntityId) {
        game.add_join_token(token.into(), true, 1).unwrap();
        join(game, token)
    }

    fn types_for(out: &[Outgoing], socket: Uuid) -> Vec<MsgType> {
        out.iter()
            .filter_map(|o| match o {
                Outgoing::Send { socket_id, data } if *socket_id == socket => peek_type(data).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_new_game_is_open() {
        let game = game(TeamMode::Solo);
        assert_eq!(game.phase, GamePhase::Initializing);
        assert!(game.can_join());
        assert_eq!(game.available_slots(), 80);
        assert!(game.world.len() > 0);
    }

    #[test]
    fn test_unknown_map_fails() {
        let result = Game::new(
            "x".into(),
            GameConfig {
                map_name: "atlantis".into(),
                team_mode: TeamMode::Solo,
            },
            GameSettings::default(),
        );
        assert!(matches!(result, Err(GameError::Map(MapError::UnknownMap(_)))));
    }

    #[test]
    fn test_token_reserves_slots() {
        let mut game = game(TeamMode::Squad);
        game.add_join_token("t".into(), true, 9).unwrap();
        assert_eq!(game.available_slots(), 80 - 4);
    }

    #[test]
    fn test_join_sends_joined_then_map() {
        let mut game = game(TeamMode::Solo);
        let (socket, id) = join_solo(&mut game, "tok");

        let out = game.take_outgoing();
        assert_eq!(types_for(&out, socket), vec![MsgType::Joined, MsgType::Map]);
        assert_eq!(game.player(id).unwrap().name, "tester");
        assert_eq!(game.available_slots(), 79);
    }

    #[test]
    fn test_join_token_is_single_use() {
        let mut game = game(TeamMode::Solo);
        join_solo(&mut game, "tok");
        game.take_outgoing();

        let intruder = Uuid::new_v4();
        game.handle_msg(intruder, &join_frame("tok"));
        let out = game.take_outgoing();
        assert_eq!(types_for(&out, intruder), vec![MsgType::Disconnect]);
        assert!(out.contains(&Outgoing::Close { socket_id: intruder }));
        assert!(game.player_for_socket(&intruder).is_none());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut game = Game::new(
            "ttl".into(),
            GameConfig {
                map_name: "main".into(),
                team_mode: TeamMode::Solo,
            },
            GameSettings {
                join_token_ttl: Duration::ZERO,
                seed: Some(1),
                ..GameSettings::default()
            },
        )
        .unwrap();
        game.add_join_token("late".into(), false, 1).unwrap();
        let socket = Uuid::new_v4();
        game.handle_msg(socket, &join_frame("late"));
        assert!(game.player_for_socket(&socket).is_none());
        assert_eq!(game.available_slots(), 80);
    }

    #[test]
    fn test_team_token_shares_group() {
        let mut game = game(TeamMode::Duo);
        game.add_join_token("pair".into(), false, 2).unwrap();
        let (_, a) = join(&mut game, "pair");
        let (_, b) = join(&mut game, "pair");
        assert_eq!(game.player(a).unwrap().group_id, game.player(b).unwrap().group_id);
        assert_eq!(game.phase, GamePhase::Initializing);
    }

    #[test]
    fn test_auto_fill_completes_open_groups() {
        let mut game = game(TeamMode::Duo);
        let (_, a) = join_solo(&mut game, "a");
        let (_, b) = join_solo(&mut game, "b");
        let (_, c) = join_solo(&mut game, "c");
        assert_eq!(game.player(a).unwrap().group_id, game.player(b).unwrap().group_id);
        assert_ne!(game.player(a).unwrap().group_id, game.player(c).unwrap().group_id);
        assert_eq!(game.phase, GamePhase::Running);
    }

    #[test]
    fn test_second_group_starts_gas() {
        let mut game = game(TeamMode::Solo);
        join_solo(&mut game, "a");
        assert_eq!(game.phase, GamePhase::Initializing);
        join_solo(&mut game, "b");
        assert_eq!(game.phase, GamePhase::Running);
        assert!(game.gas.is_running());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut game = game(TeamMode::Solo);
        game.handle_msg(Uuid::new_v4(), &[]);
        game.handle_msg(Uuid::new_v4(), &[MsgType::Join as u8, 1]);
        assert!(game.take_outgoing().is_empty());
    }

    #[test]
    fn test_stale_input_is_ignored() {
        let mut game = game(TeamMode::Solo);
        let (socket, id) = join_solo(&mut game, "a");
        let held = InputState {
            move_up: true,
            ..InputState::default()
        };
        game.handle_input(socket, 5, held);
        game.handle_input(socket, 4, InputState::default());
        assert_eq!(game.player(id).unwrap().input, held);
    }

    #[test]
    fn test_kill_drops_loot_and_ends_duel() {
        let mut game = game(TeamMode::Solo);
        let (a_socket, a) = join_solo(&mut game, "a");
        let (b_socket, b) = join_solo(&mut game, "b");
        game.take_outgoing();
        let loot_before = game.world.count_of(EntityKind::Loot);
        let decals_before = game.world.count_of(EntityKind::Decal);

        game.damage_player(b, 250.0, Some(a));
        assert!(!game.player(b).unwrap().is_alive());
        assert_eq!(game.player(a).unwrap().kills, 1);
        assert_eq!(game.world.count_of(EntityKind::Loot), loot_before + 2);
        assert_eq!(game.world.count_of(EntityKind::Decal), decals_before + 1);

        game.tick(0.01);
        assert!(game.is_stopped());
        assert!(!game.can_join());

        let out = game.take_outgoing();
        assert!(types_for(&out, b_socket).contains(&MsgType::Kill));
        assert!(types_for(&out, b_socket).contains(&MsgType::GameOver));
        let winner = out
            .iter()
            .find_map(|o| match o {
                Outgoing::Send { socket_id, data } if *socket_id == a_socket && data[0] == MsgType::GameOver as u8 => {
                    Some(GameOverMsg::read(&mut MsgReader::new(&data[1..])).unwrap())
                }
                _ => None,
            })
            .unwrap();
        assert!(winner.won);
        assert_eq!(winner.rank, 1);
        assert_eq!(winner.kills, 1);
    }

    #[test]
    fn test_kill_leader_needs_three_kills() {
        let mut game = game(TeamMode::Solo);
        let players: Vec<EntityId> = (0..5).map(|i| join_solo(&mut game, &format!("p{i}")).1).collect();
        let leader = players[0];

        for (n, victim) in players[1..4].iter().enumerate() {
            game.damage_player(*victim, 500.0, Some(leader));
            if n < 2 {
                assert_eq!(game.kill_leader(), None);
            }
        }
        assert_eq!(game.kill_leader(), Some(leader));
        assert_eq!(game.alive_sides(), 2);
    }

    #[test]
    fn test_disconnect_eliminates_player() {
        let mut game = game(TeamMode::Solo);
        let (socket, id) = join_solo(&mut game, "a");
        join_solo(&mut game, "b");
        game.handle_socket_close(socket);
        assert!(game.player(id).unwrap().dead);
        assert_eq!(game.connected_count(), 1);
    }

    #[test]
    fn test_net_sync_sends_update_to_each_socket() {
        let mut game = game(TeamMode::Solo);
        let (a, _) = join_solo(&mut game, "a");
        let (b, _) = join_solo(&mut game, "b");
        game.take_outgoing();

        game.tick(0.01);
        game.net_sync();
        let out = game.take_outgoing();
        assert_eq!(types_for(&out, a), vec![MsgType::Update]);
        assert_eq!(types_for(&out, b), vec![MsgType::Update]);
    }

    #[test]
    fn test_players_move_with_input() {
        let mut game = game(TeamMode::Solo);
        let (socket, id) = join_solo(&mut game, "a");
        let start = game.player(id).unwrap().pos;
        let input = InputState {
            move_right: true,
            ..InputState::default()
        };
        game.handle_input(socket, 1, input);
        for _ in 0..10 {
            game.tick(0.01);
        }
        assert_ne!(game.player(id).unwrap().pos, start);
    }

    #[test]
    fn test_shooting_respects_cooldown() {
        let mut game = game(TeamMode::Solo);
        let (socket, id) = join_solo(&mut game, "a");
        let input = InputState {
            shoot: true,
            aim: crate::geom::Vec2::new(1.0, 0.0),
            ..InputState::default()
        };
        game.handle_input(socket, 1, input);

        game.tick(0.001);
        let cooldown = game.player(id).unwrap().weapon_cooldown;
        assert_eq!(cooldown, WeaponStats::default().cooldown);

        game.tick(0.001);
        assert!(game.player(id).unwrap().weapon_cooldown < cooldown);
        assert!(game.world.count_of(EntityKind::Projectile) <= 1);
    }

    #[test]
    fn test_empty_game_stops() {
        let mut game = Game::new(
            "idle".into(),
            GameConfig {
                map_name: "main".into(),
                team_mode: TeamMode::Solo,
            },
            GameSettings {
                empty_timeout: Duration::ZERO,
                seed: Some(3),
                ..GameSettings::default()
            },
        )
        .unwrap();
        game.tick(0.01);
        assert!(game.is_stopped());
    }

    #[test]
    fn test_stop_closes_sockets() {
        let mut game = game(TeamMode::Solo);
        let (socket, _) = join_solo(&mut game, "a");
        game.take_outgoing();
        game.stop("shutdown");
        let out = game.take_outgoing();
        assert!(out.contains(&Outgoing::Close { socket_id: socket }));
        assert!(game.is_stopped());
        assert_eq!(game.connected_count(), 0);
    }

    #[test]
    fn test_fixed_debug_spawn_uses_center() {
        let mut game = Game::new(
            "fixed".into(),
            GameConfig {
                map_name: "main".into(),
                team_mode: TeamMode::Solo,
            },
            GameSettings {
                debug: DebugConfig {
                    spawn_mode: SpawnMode::Fixed,
                    spawn_pos: None,
                },
                seed: Some(5),
                ..GameSettings::default()
            },
        )
        .unwrap();
        let (_, id) = join_solo(&mut game, "a");
        assert_eq!(game.player(id).unwrap().pos, game.map.center);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("   "), DEFAULT_NAME);
        assert_eq!(sanitize_name("a\u{7}b"), "ab");
        assert_eq!(sanitize_name(&"x".repeat(40)).len(), MAX_NAME_LEN);
    }
}
