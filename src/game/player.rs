//! Players, groups, teams and pending join tokens

use std::collections::BTreeSet;
use std::time::Instant;

use uuid::Uuid;

use crate::geom::Vec2;

use super::entity::{EntityId, LAYER_GROUND};

pub const PLAYER_RADIUS: f32 = 1.0;
pub const PLAYER_MAX_HEALTH: f32 = 100.0;
/// Units per second
pub const PLAYER_SPEED: f32 = 12.0;
pub const WATER_SPEED_FACTOR: f32 = 0.7;
/// Closest a new spawn may be to a living enemy
pub const MIN_SPAWN_RAD: f32 = 25.0;
/// Closest a new spawn may be to an earlier spawn point
pub const MIN_POS_SPAWN_RAD: f32 = 10.0;
/// Teammates spawn within this radius of the first group member
pub const TEAMMATE_SPAWN_RADIUS: f32 = 5.0;
/// Kills needed before a player can become kill leader
pub const KILL_LEADER_MIN_KILLS: u32 = 3;
/// Half extents of the area a client is sent objects for
pub const VIEW_HALF_WIDTH: f32 = 48.0;
pub const VIEW_HALF_HEIGHT: f32 = 32.0;

/// Input held by a player until the next input message
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub move_left: bool,
    pub move_right: bool,
    pub move_up: bool,
    pub move_down: bool,
    pub shoot: bool,
    /// Aim direction, not necessarily normalized
    pub aim: Vec2,
}

impl InputState {
    /// Normalized movement direction, zero when idle
    pub fn move_dir(&self) -> Vec2 {
        let mut dir = Vec2::ZERO;
        if self.move_left {
            dir.x -= 1.0;
        }
        if self.move_right {
            dir.x += 1.0;
        }
        if self.move_up {
            dir.y += 1.0;
        }
        if self.move_down {
            dir.y -= 1.0;
        }
        dir.normalize_or(Vec2::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: EntityId,
    pub socket_id: Uuid,
    pub name: String,
    pub group_id: u8,
    /// Faction team, 0 outside faction mode
    pub team_id: u8,
    pub pos: Vec2,
    pub dir: Vec2,
    pub layer: u8,
    pub health: f32,
    pub dead: bool,
    pub disconnected: bool,
    pub input: InputState,
    pub last_input_seq: u32,
    pub weapon_cooldown: f32,
    pub kills: u32,
    pub damage_dealt: f32,
    /// Objects this player's client currently holds
    pub known: BTreeSet<EntityId>,
}

impl Player {
    pub fn new(id: EntityId, socket_id: Uuid, name: String, group_id: u8, team_id: u8, pos: Vec2) -> Self {
        Self {
            id,
            socket_id,
            name,
            group_id,
            team_id,
            pos,
            dir: Vec2::new(1.0, 0.0),
            layer: LAYER_GROUND,
            health: PLAYER_MAX_HEALTH,
            dead: false,
            disconnected: false,
            input: InputState::default(),
            last_input_seq: 0,
            weapon_cooldown: 0.0,
            kills: 0,
            damage_dealt: 0.0,
            known: BTreeSet::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }

    /// True when `other` is on this player's side
    pub fn is_ally(&self, group_id: u8, team_id: u8) -> bool {
        self.group_id == group_id || (self.team_id != 0 && self.team_id == team_id)
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: u8,
    pub auto_fill: bool,
    pub players: Vec<EntityId>,
    /// Seats held for token holders that have not connected yet
    pub reserved: usize,
}

impl Group {
    pub fn new(id: u8, auto_fill: bool) -> Self {
        Self {
            id,
            auto_fill,
            players: Vec::new(),
            reserved: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.players.len() + self.reserved
    }
}

#[derive(Debug, Clone)]
pub struct Team {
    pub id: u8,
    pub players: Vec<EntityId>,
}

/// Single-use credential issued by find-game
#[derive(Debug, Clone)]
pub struct JoinToken {
    pub token: String,
    pub auto_fill: bool,
    pub player_count: u8,
    /// Slots still unclaimed by this token
    pub remaining: u8,
    pub group_id: Option<u8>,
    pub expires_at: Instant,
}

impl JoinToken {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_dir_is_normalized() {
        let input = InputState {
            move_up: true,
            move_right: true,
            ..InputState::default()
        };
        assert!((input.move_dir().length() - 1.0).abs() < 1e-5);
        assert_eq!(InputState::default().move_dir(), Vec2::ZERO);
    }

    #[test]
    fn test_ally_checks() {
        let p = Player::new(1, Uuid::new_v4(), "a".into(), 3, 0, Vec2::ZERO);
        assert!(p.is_ally(3, 0));
        assert!(!p.is_ally(4, 0));

        let f = Player::new(2, Uuid::new_v4(), "b".into(), 3, 1, Vec2::ZERO);
        assert!(f.is_ally(9, 1));
        assert!(!f.is_ally(9, 2));
    }
}
