//! Binary wire messages exchanged with game clients

use crate::game::entity::{Entity, EntityId, EntityKind};
use crate::game::gas::Gas;
use crate::game::map::GameMap;
use crate::game::player::InputState;

use super::stream::{MsgReader, MsgWriter, ProtocolError};

/// Bumped whenever a message layout changes
pub const PROTOCOL_VERSION: u32 = 1;

const INPUT_LEFT: u8 = 1 << 0;
const INPUT_RIGHT: u8 = 1 << 1;
const INPUT_UP: u8 = 1 << 2;
const INPUT_DOWN: u8 = 1 << 3;
const INPUT_SHOOT: u8 = 1 << 4;

const UPDATE_DELETED: u8 = 1 << 0;
const UPDATE_FULL: u8 = 1 << 1;
const UPDATE_PART: u8 = 1 << 2;
const UPDATE_GAS: u8 = 1 << 3;
const UPDATE_GAS_T: u8 = 1 << 4;
const UPDATE_ALIVE: u8 = 1 << 5;
const UPDATE_KILL_LEADER: u8 = 1 << 6;

/// Leading byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Join = 1,
    Input = 2,
    Joined = 3,
    Map = 4,
    Update = 5,
    Kill = 6,
    GameOver = 7,
    Disconnect = 8,
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => MsgType::Join,
            2 => MsgType::Input,
            3 => MsgType::Joined,
            4 => MsgType::Map,
            5 => MsgType::Update,
            6 => MsgType::Kill,
            7 => MsgType::GameOver,
            8 => MsgType::Disconnect,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Type of a frame without decoding the rest
pub fn peek_type(frame: &[u8]) -> Result<MsgType, ProtocolError> {
    let first = frame.first().ok_or(ProtocolError::Empty)?;
    MsgType::try_from(*first)
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// First message on a socket, claims a seat with a join token
    Join {
        protocol: u32,
        token: String,
        name: String,
    },

    /// Held input, replaces the previous one
    Input {
        /// Stale inputs (seq not above the last one) are ignored
        seq: u32,
        input: InputState,
    },
}

impl ClientMsg {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let msg_type = peek_type(frame)?;
        let mut r = MsgReader::new(&frame[1..]);

        match msg_type {
            MsgType::Join => Ok(ClientMsg::Join {
                protocol: r.read_u32()?,
                token: r.read_string()?,
                name: r.read_string()?,
            }),
            MsgType::Input => {
                let seq = r.read_u32()?;
                let keys = r.read_u8()?;
                let aim = r.read_vec2()?;
                Ok(ClientMsg::Input {
                    seq,
                    input: InputState {
                        move_left: keys & INPUT_LEFT != 0,
                        move_right: keys & INPUT_RIGHT != 0,
                        move_up: keys & INPUT_UP != 0,
                        move_down: keys & INPUT_DOWN != 0,
                        shoot: keys & INPUT_SHOOT != 0,
                        aim: if aim.x.is_finite() && aim.y.is_finite() { aim } else { Default::default() },
                    },
                })
            }
            other => Err(ProtocolError::Unexpected(other as u8)),
        }
    }

    pub fn encode(&self, w: &mut MsgWriter) {
        match self {
            ClientMsg::Join { protocol, token, name } => {
                w.write_u8(MsgType::Join as u8);
                w.write_u32(*protocol);
                w.write_string(token);
                w.write_string(name);
            }
            ClientMsg::Input { seq, input } => {
                let mut keys = 0;
                for (held, bit) in [
                    (input.move_left, INPUT_LEFT),
                    (input.move_right, INPUT_RIGHT),
                    (input.move_up, INPUT_UP),
                    (input.move_down, INPUT_DOWN),
                    (input.shoot, INPUT_SHOOT),
                ] {
                    if held {
                        keys |= bit;
                    }
                }
                w.write_u8(MsgType::Input as u8);
                w.write_u32(*seq);
                w.write_u8(keys);
                w.write_vec2(input.aim);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinedMsg {
    pub player_id: EntityId,
    pub group_id: u8,
    pub team_id: u8,
    pub team_size: u8,
}

impl JoinedMsg {
    fn write(&self, w: &mut MsgWriter) {
        w.write_u16(self.player_id);
        w.write_u8(self.group_id);
        w.write_u8(self.team_id);
        w.write_u8(self.team_size);
    }

    pub fn read(r: &mut MsgReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            player_id: r.read_u16()?,
            group_id: r.read_u8()?,
            team_id: r.read_u8()?,
            team_size: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillMsg {
    pub victim: EntityId,
    /// 0 for gas and disconnect deaths
    pub killer: EntityId,
    pub killer_kills: u32,
}

impl KillMsg {
    fn write(&self, w: &mut MsgWriter) {
        w.write_u16(self.victim);
        w.write_u16(self.killer);
        w.write_u32(self.killer_kills);
    }

    pub fn read(r: &mut MsgReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            victim: r.read_u16()?,
            killer: r.read_u16()?,
            killer_kills: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameOverMsg {
    pub rank: u8,
    pub won: bool,
    pub kills: u32,
    pub damage_dealt: f32,
}

impl GameOverMsg {
    fn write(&self, w: &mut MsgWriter) {
        w.write_u8(self.rank);
        w.write_bool(self.won);
        w.write_u32(self.kills);
        w.write_f32(self.damage_dealt);
    }

    pub fn read(r: &mut MsgReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            rank: r.read_u8()?,
            won: r.read_bool()?,
            kills: r.read_u32()?,
            damage_dealt: r.read_f32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillLeaderMsg {
    /// 0 when nobody holds the title
    pub player_id: EntityId,
    pub kills: u32,
}

/// State of the receiving player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivePlayerMsg {
    pub player_id: EntityId,
    pub health: f32,
    pub dead: bool,
}

/// One net sync worth of changes for one client
#[derive(Debug, Default)]
pub struct UpdateMsg<'a> {
    pub active: Option<ActivePlayerMsg>,
    pub deleted: Vec<EntityId>,
    /// New to the client or fully changed
    pub full: Vec<&'a Entity>,
    /// Known to the client, only the frequently changing fields
    pub part: Vec<&'a Entity>,
    pub gas: Option<&'a Gas>,
    /// Progress through the current gas stage, 0..=1
    pub gas_t: Option<f32>,
    pub alive_count: Option<u8>,
    pub kill_leader: Option<KillLeaderMsg>,
}

impl UpdateMsg<'_> {
    fn write(&self, w: &mut MsgWriter) {
        let mut flags = 0;
        for (present, bit) in [
            (!self.deleted.is_empty(), UPDATE_DELETED),
            (!self.full.is_empty(), UPDATE_FULL),
            (!self.part.is_empty(), UPDATE_PART),
            (self.gas.is_some(), UPDATE_GAS),
            (self.gas_t.is_some(), UPDATE_GAS_T),
            (self.alive_count.is_some(), UPDATE_ALIVE),
            (self.kill_leader.is_some(), UPDATE_KILL_LEADER),
        ] {
            if present {
                flags |= bit;
            }
        }
        w.write_u8(flags);

        let active = self.active.unwrap_or(ActivePlayerMsg {
            player_id: 0,
            health: 0.0,
            dead: true,
        });
        w.write_u16(active.player_id);
        w.write_f32(active.health);
        w.write_bool(active.dead);

        if !self.deleted.is_empty() {
            w.write_u16(self.deleted.len() as u16);
            for id in &self.deleted {
                w.write_u16(*id);
            }
        }
        if !self.full.is_empty() {
            w.write_u16(self.full.len() as u16);
            for e in &self.full {
                w.write_u8(e.kind() as u8);
                w.write_u16(e.id());
                write_full(w, e);
                write_part(w, e);
            }
        }
        if !self.part.is_empty() {
            w.write_u16(self.part.len() as u16);
            for e in &self.part {
                w.write_u16(e.id());
                write_part(w, e);
            }
        }
        if let Some(gas) = self.gas {
            w.write_u8(gas.stage as u8);
            w.write_u8(gas.mode as u8);
            w.write_f32(gas.duration);
            w.write_vec2(gas.pos_old);
            w.write_vec2(gas.pos_new);
            w.write_f32(gas.rad_old);
            w.write_f32(gas.rad_new);
            w.write_f32(gas.damage);
        }
        if let Some(t) = self.gas_t {
            w.write_f32(t);
        }
        if let Some(alive) = self.alive_count {
            w.write_u8(alive);
        }
        if let Some(leader) = self.kill_leader {
            w.write_u16(leader.player_id);
            w.write_u32(leader.kills);
        }
    }
}

/// Fields a client needs once per object
fn write_full(w: &mut MsgWriter, entity: &Entity) {
    match entity {
        Entity::Player(p) => {
            w.write_string(&p.name);
            w.write_u8(p.group_id);
            w.write_u8(p.team_id);
            w.write_u8(p.layer);
            w.write_bool(p.dead);
        }
        Entity::Obstacle(o) => {
            w.write_string(o.type_name);
            w.write_u8(o.layer);
            w.write_bool(o.destructible);
        }
        Entity::Loot(l) => {
            w.write_string(l.item);
            w.write_u16(l.count);
            w.write_u8(l.layer);
        }
        Entity::Building(b) => {
            w.write_string(b.type_name);
            w.write_u8(b.ori);
            w.write_u8(b.layer);
        }
        Entity::Structure(s) => {
            w.write_string(s.type_name);
            w.write_u8(s.ori);
            w.write_u8(s.layer);
            w.write_u8(s.layer_ids.len() as u8);
            for id in &s.layer_ids {
                w.write_u16(*id);
            }
        }
        Entity::Decal(d) => {
            w.write_string(d.type_name);
            w.write_u8(d.ori);
            w.write_f32(d.scale);
            w.write_u8(d.layer);
        }
        Entity::Projectile(p) => {
            w.write_vec2(p.dir);
            w.write_u8(p.layer);
            w.write_u16(p.owner);
        }
        Entity::Airdrop(_) => {}
    }
}

/// Fields that change while an object lives
fn write_part(w: &mut MsgWriter, entity: &Entity) {
    match entity {
        Entity::Player(p) => {
            w.write_vec2(p.pos);
            w.write_vec2(p.dir);
        }
        Entity::Obstacle(o) => {
            w.write_vec2(o.pos);
            w.write_u8(o.ori);
            w.write_f32(o.scale);
            let health = if o.max_health > 0.0 { o.health / o.max_health } else { 1.0 };
            w.write_u8((health.clamp(0.0, 1.0) * 255.0).round() as u8);
            w.write_bool(o.dead);
        }
        Entity::Building(b) => w.write_bool(b.occupied),
        Entity::Airdrop(a) => {
            w.write_vec2(a.pos);
            w.write_f32(a.fall_time.max(0.0));
            w.write_bool(a.landed);
        }
        Entity::Loot(_) | Entity::Structure(_) | Entity::Decal(_) | Entity::Projectile(_) => {
            w.write_vec2(entity.pos());
        }
    }
}

fn write_map(w: &mut MsgWriter, map: &GameMap) {
    w.write_string(map.name);
    w.write_u64(map.seed);
    w.write_f32(map.width);
    w.write_f32(map.height);
    w.write_f32(map.shore_inset);
    w.write_f32(map.grass_inset);

    w.write_u8(map.river_descs.len() as u8);
    for river in &map.river_descs {
        w.write_f32(river.width);
        w.write_bool(river.looped);
        w.write_u16(river.points.len() as u16);
        for p in &river.points {
            w.write_vec2(*p);
        }
    }

    w.write_u8(map.places.len() as u8);
    for place in &map.places {
        w.write_string(place.name);
        w.write_vec2(place.pos);
    }

    w.write_u16(map.displayed_objects.len() as u16);
    for obj in &map.displayed_objects {
        w.write_string(obj.type_name);
        w.write_vec2(obj.pos);
        w.write_u8(obj.ori);
        w.write_f32(obj.scale);
    }

    w.write_u16(map.ground_patches.len() as u16);
    for patch in &map.ground_patches {
        w.write_vec2(patch.bound.min);
        w.write_vec2(patch.bound.max);
        w.write_u32(patch.color);
    }
}

/// Messages sent from server to client
pub enum ServerMsg<'a> {
    Joined(JoinedMsg),
    /// Whole map, sent once right after `Joined`
    Map(&'a GameMap),
    Update(UpdateMsg<'a>),
    Kill(KillMsg),
    GameOver(GameOverMsg),
    /// Sent before the server closes the socket
    Disconnect { reason: &'a str },
}

impl ServerMsg<'_> {
    pub fn msg_type(&self) -> MsgType {
        match self {
            ServerMsg::Joined(_) => MsgType::Joined,
            ServerMsg::Map(_) => MsgType::Map,
            ServerMsg::Update(_) => MsgType::Update,
            ServerMsg::Kill(_) => MsgType::Kill,
            ServerMsg::GameOver(_) => MsgType::GameOver,
            ServerMsg::Disconnect { .. } => MsgType::Disconnect,
        }
    }

    pub fn encode(&self, w: &mut MsgWriter) {
        w.write_u8(self.msg_type() as u8);
        match self {
            ServerMsg::Joined(msg) => msg.write(w),
            ServerMsg::Map(map) => write_map(w, map),
            ServerMsg::Update(msg) => msg.write(w),
            ServerMsg::Kill(msg) => msg.write(w),
            ServerMsg::GameOver(msg) => msg.write(w),
            ServerMsg::Disconnect { reason } => w.write_string(reason),
        }
    }
}

/// Entity kind byte as written in full updates
pub fn kind_from_u8(v: u8) -> Option<EntityKind> {
    EntityKind::ALL.iter().copied().find(|k| *k as u8 == v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Loot;
    use crate::geom::Vec2;

    fn frame(msg: &ServerMsg<'_>) -> bytes::Bytes {
        let mut w = MsgWriter::new();
        msg.encode(&mut w);
        w.take()
    }

    #[test]
    fn test_client_join_decodes() {
        let msg = ClientMsg::Join {
            protocol: PROTOCOL_VERSION,
            token: "abc123".into(),
            name: "rusty".into(),
        };
        let mut w = MsgWriter::new();
        msg.encode(&mut w);
        assert_eq!(ClientMsg::decode(&w.take()).unwrap(), msg);
    }

    #[test]
    fn test_input_keys_are_packed() {
        let input = InputState {
            move_left: true,
            move_down: true,
            shoot: true,
            aim: Vec2::new(0.0, 1.0),
            ..InputState::default()
        };
        let mut w = MsgWriter::new();
        ClientMsg::Input { seq: 9, input }.encode(&mut w);
        let bytes = w.take();
        assert_eq!(bytes[5], INPUT_LEFT | INPUT_DOWN | INPUT_SHOOT);
        assert_eq!(ClientMsg::decode(&bytes).unwrap(), ClientMsg::Input { seq: 9, input });
    }

    #[test]
    fn test_non_finite_aim_is_zeroed() {
        let mut w = MsgWriter::new();
        w.write_u8(MsgType::Input as u8);
        w.write_u32(1);
        w.write_u8(0);
        w.write_vec2(Vec2::new(f32::NAN, 1.0));
        match ClientMsg::decode(&w.take()).unwrap() {
            ClientMsg::Input { input, .. } => assert_eq!(input.aim, Vec2::ZERO),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_client_frames() {
        assert_eq!(ClientMsg::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(ClientMsg::decode(&[200]), Err(ProtocolError::UnknownType(200)));
        assert_eq!(
            ClientMsg::decode(&[MsgType::Update as u8]),
            Err(ProtocolError::Unexpected(MsgType::Update as u8))
        );
        assert!(matches!(
            ClientMsg::decode(&[MsgType::Input as u8, 1, 0]),
            Err(ProtocolError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_kill_frame_layout() {
        let kill = KillMsg {
            victim: 4,
            killer: 9,
            killer_kills: 2,
        };
        let bytes = frame(&ServerMsg::Kill(kill));
        assert_eq!(peek_type(&bytes).unwrap(), MsgType::Kill);
        assert_eq!(KillMsg::read(&mut MsgReader::new(&bytes[1..])).unwrap(), kill);
    }

    #[test]
    fn test_disconnect_carries_reason() {
        let bytes = frame(&ServerMsg::Disconnect { reason: "invalid_token" });
        let mut r = MsgReader::new(&bytes[1..]);
        assert_eq!(r.read_string().unwrap(), "invalid_token");
    }

    #[test]
    fn test_update_flags_track_sections() {
        let loot = Entity::Loot(Loot {
            id: 7,
            item: "bandage",
            count: 2,
            pos: Vec2::new(1.0, 2.0),
            layer: 0,
        });
        let update = UpdateMsg {
            deleted: vec![3],
            full: vec![&loot],
            alive_count: Some(12),
            ..UpdateMsg::default()
        };
        let bytes = frame(&ServerMsg::Update(update));
        let mut r = MsgReader::new(&bytes[1..]);
        assert_eq!(r.read_u8().unwrap(), UPDATE_DELETED | UPDATE_FULL | UPDATE_ALIVE);

        // active player block
        r.read_u16().unwrap();
        r.read_f32().unwrap();
        r.read_bool().unwrap();

        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 3);
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(kind_from_u8(r.read_u8().unwrap()), Some(EntityKind::Loot));
        assert_eq!(r.read_u16().unwrap(), 7);
        assert_eq!(r.read_string().unwrap(), "bandage");
        assert_eq!(r.read_u16().unwrap(), 2);
        assert_eq!(r.read_u8().unwrap(), 0);
        assert_eq!(r.read_vec2().unwrap(), Vec2::new(1.0, 2.0));
        assert_eq!(r.read_u8().unwrap(), 12);
        assert_eq!(r.remaining(), 0);
    }
}
