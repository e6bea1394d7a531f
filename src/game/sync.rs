//! Per-player delta updates

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::geom::Aabb;
use crate::ws::protocol::{ActivePlayerMsg, KillLeaderMsg, ServerMsg, UpdateMsg};
use crate::ws::stream::MsgWriter;

use super::entity::{Entity, EntityId};
use super::gas::Gas;
use super::player::{VIEW_HALF_HEIGHT, VIEW_HALF_WIDTH};
use super::world::{DirtyFrame, World};

/// Match-wide state attached to every update
#[derive(Debug)]
pub struct GlobalState<'a> {
    pub gas: &'a Gas,
    pub gas_dirty: bool,
    pub alive_count: u8,
    pub alive_dirty: bool,
    pub kill_leader: KillLeaderMsg,
    pub kill_leader_dirty: bool,
}

/// Builds update frames into one reused buffer
pub struct NetSync {
    writer: MsgWriter,
}

impl NetSync {
    pub fn new() -> Self {
        Self {
            writer: MsgWriter::new(),
        }
    }

    /// Update frame for one player: objects that left its view or were
    /// destroyed, new or fully changed objects in view, and the dirty part of
    /// objects it already knows. `None` if the player is gone.
    pub fn player_update(
        &mut self,
        world: &mut World,
        player_id: EntityId,
        frame: &DirtyFrame,
        globals: &GlobalState<'_>,
    ) -> Option<Bytes> {
        let player = world.get_mut(player_id).and_then(Entity::as_player_mut)?;
        let mut known = std::mem::take(&mut player.known);
        let first_sync = known.is_empty();
        let active = ActivePlayerMsg {
            player_id,
            health: player.health,
            dead: player.dead,
        };
        let view = Aabb::from_center(player.pos, VIEW_HALF_WIDTH, VIEW_HALF_HEIGHT);

        let mut visible: BTreeSet<EntityId> = world.query(&view).map(Entity::id).collect();
        visible.insert(player_id);

        let mut deleted: Vec<EntityId> = frame.deleted.iter().copied().filter(|id| known.remove(id)).collect();
        deleted.extend(known.difference(&visible).copied());

        let full: Vec<&Entity> = visible
            .iter()
            .filter(|id| !known.contains(id) || frame.full.contains(id))
            .filter_map(|id| world.get(*id))
            .collect();
        let part: Vec<&Entity> = visible
            .iter()
            .filter(|id| known.contains(id) && !frame.full.contains(id) && frame.part.contains(id))
            .filter_map(|id| world.get(*id))
            .collect();

        let gas = globals.gas;
        let update = UpdateMsg {
            active: Some(active),
            deleted,
            full,
            part,
            gas: (globals.gas_dirty || first_sync).then_some(gas),
            gas_t: gas.is_running().then(|| gas.progress()),
            alive_count: (globals.alive_dirty || first_sync).then_some(globals.alive_count),
            kill_leader: (globals.kill_leader_dirty || first_sync).then_some(globals.kill_leader),
        };
        ServerMsg::Update(update).encode(&mut self.writer);
        let data = self.writer.take();

        if let Some(player) = world.get_mut(player_id).and_then(Entity::as_player_mut) {
            player.known = visible;
        }
        Some(data)
    }
}

impl Default for NetSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::map_def;
    use crate::game::entity::{EntityKind, Loot};
    use crate::game::player::Player;
    use crate::geom::Vec2;
    use crate::ws::protocol::{kind_from_u8, peek_type, MsgType};
    use crate::ws::stream::MsgReader;
    use uuid::Uuid;

    struct Fixture {
        world: World,
        gas: Gas,
        player: EntityId,
    }

    fn fixture() -> Fixture {
        let mut world = World::new(400.0, 400.0);
        let player = world
            .insert(|id| Entity::Player(Box::new(Player::new(id, Uuid::new_v4(), "p".into(), 1, 0, Vec2::new(100.0, 100.0)))))
            .unwrap();
        let gas = Gas::new(&map_def("main").unwrap().gas, 400.0, 400.0);
        Fixture { world, gas, player }
    }

    fn add_loot(world: &mut World, pos: Vec2) -> EntityId {
        world
            .insert(|id| {
                Entity::Loot(Loot {
                    id,
                    item: "bandage",
                    count: 1,
                    pos,
                    layer: 0,
                })
            })
            .unwrap()
    }

    fn globals(gas: &Gas) -> GlobalState<'_> {
        GlobalState {
            gas,
            gas_dirty: false,
            alive_count: 1,
            alive_dirty: false,
            kill_leader: KillLeaderMsg { player_id: 0, kills: 0 },
            kill_leader_dirty: false,
        }
    }

    /// Ids listed in the deleted and full sections of an update frame
    fn sections(bytes: &[u8]) -> (Vec<EntityId>, Vec<(EntityKind, EntityId)>) {
        assert_eq!(peek_type(bytes).unwrap(), MsgType::Update);
        let mut r = MsgReader::new(&bytes[1..]);
        let flags = r.read_u8().unwrap();
        r.read_u16().unwrap();
        r.read_f32().unwrap();
        r.read_bool().unwrap();

        let mut deleted = Vec::new();
        if flags & 1 != 0 {
            for _ in 0..r.read_u16().unwrap() {
                deleted.push(r.read_u16().unwrap());
            }
        }
        let mut full = Vec::new();
        if flags & 2 != 0 {
            // only the first entry is decoded; its kind and id are enough here
            r.read_u16().unwrap();
            let kind = kind_from_u8(r.read_u8().unwrap()).unwrap();
            full.push((kind, r.read_u16().unwrap()));
        }
        (deleted, full)
    }

    #[test]
    fn test_first_update_knows_view() {
        let mut f = fixture();
        let near = add_loot(&mut f.world, Vec2::new(110.0, 100.0));
        let far = add_loot(&mut f.world, Vec2::new(300.0, 300.0));
        let frame = f.world.take_dirty();

        let mut sync = NetSync::new();
        let bytes = sync.player_update(&mut f.world, f.player, &frame, &globals(&f.gas)).unwrap();
        let (deleted, full) = sections(&bytes);
        assert!(deleted.is_empty());
        assert_eq!(full[0], (EntityKind::Player, f.player));

        let known = &f.world.get(f.player).and_then(Entity::as_player).unwrap().known;
        assert!(known.contains(&near));
        assert!(!known.contains(&far));
    }

    #[test]
    fn test_leaving_view_and_removal_become_deletions() {
        let mut f = fixture();
        let near = add_loot(&mut f.world, Vec2::new(110.0, 100.0));
        let doomed = add_loot(&mut f.world, Vec2::new(90.0, 100.0));
        let mut sync = NetSync::new();
        let frame = f.world.take_dirty();
        sync.player_update(&mut f.world, f.player, &frame, &globals(&f.gas)).unwrap();

        f.world.remove(doomed);
        if let Some(p) = f.world.get_mut(f.player).and_then(Entity::as_player_mut) {
            p.pos = Vec2::new(300.0, 300.0);
        }
        f.world.refresh(f.player);
        f.world.mark_part_dirty(f.player);

        let frame = f.world.take_dirty();
        let bytes = sync.player_update(&mut f.world, f.player, &frame, &globals(&f.gas)).unwrap();
        let (deleted, _) = sections(&bytes);
        assert!(deleted.contains(&doomed));
        assert!(deleted.contains(&near));
        assert_eq!(deleted.len(), 2);
    }

    #[test]
    fn test_unchanged_objects_are_not_resent() {
        let mut f = fixture();
        add_loot(&mut f.world, Vec2::new(110.0, 100.0));
        let mut sync = NetSync::new();
        let frame = f.world.take_dirty();
        let first = sync.player_update(&mut f.world, f.player, &frame, &globals(&f.gas)).unwrap();

        let frame = f.world.take_dirty();
        let second = sync.player_update(&mut f.world, f.player, &frame, &globals(&f.gas)).unwrap();
        assert!(second.len() < first.len());
        let (deleted, full) = sections(&second);
        assert!(deleted.is_empty() && full.is_empty());
    }

    #[test]
    fn test_missing_player_yields_nothing() {
        let mut f = fixture();
        let frame = f.world.take_dirty();
        let mut sync = NetSync::new();
        assert!(sync.player_update(&mut f.world, 999, &frame, &globals(&f.gas)).is_none());
    }
}
