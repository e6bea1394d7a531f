//! Generated map of one match
//!
//! Terrain and static objects are produced once, deterministically from the
//! map definition and a seed. Afterwards the map answers placement, spawn and
//! ground surface queries against the match's [`World`].

pub mod colliders;
mod generate;
pub mod terrain;

use std::collections::HashMap;

use tracing::{error, warn};

use crate::config::{DebugConfig, SpawnMode};
use crate::defs::maps::PlaceDef;
use crate::defs::{map_def, object_def, MapDef, TeamMode};
use crate::geom::poly::{aabb_intersects_polygon, point_in_polygon};
use crate::geom::{ori_to_rad, Aabb, Vec2};
use crate::util::rng::SeededRng;

use super::entity::{same_layer, Entity, EntityId, EntityKind, LAYER_BUNKER, LAYER_GROUND, LAYER_STAIRS};
use super::player::{MIN_POS_SPAWN_RAD, MIN_SPAWN_RAD, PLAYER_RADIUS, TEAMMATE_SPAWN_RADIUS};
use super::world::{IdsExhausted, World};

pub use generate::{spawn_decal, spawn_loot, spawn_obstacle};

use colliders::colliders_for;
use terrain::{RiverDesc, Terrain};

/// Attempts per placed object before giving up on it
pub const MAX_SPAWN_ATTEMPTS: usize = 1000;
const PLAYER_SPAWN_ATTEMPTS: usize = 500;
/// Below this many living players occupancy scans them all instead of the grid
const OCCUPANCY_SCAN_LIMIT: usize = 20;
const AIRDROP_SPAWN_CLEARANCE: f32 = 8.0;
const PROJECTILE_SPAWN_CLEARANCE: f32 = 16.0;
/// Faction maps split each half into five bands; teams own the outermost ones
const FACTION_DIVISIONS: usize = 10;
/// Ground reported for grass inside a river's shore band
const RIVER_SHORE_SURFACE: &str = "sand";

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("unknown map `{0}`")]
    UnknownMap(String),
    #[error(transparent)]
    Ids(#[from] IdsExhausted),
}

/// Object drawn on the client's minimap
#[derive(Debug, Clone, PartialEq)]
pub struct MapObjectMsg {
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundPatchMsg {
    pub bound: Aabb,
    pub color: u32,
}

#[derive(Debug, Clone)]
pub struct Lake {
    /// Index into the river list
    pub river: usize,
    pub center: Vec2,
}

#[derive(Debug, Clone)]
struct PlacedBridge {
    type_name: &'static str,
    pos: Vec2,
    ori: u8,
}

/// Floor a position stands on and the river it belongs to, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundSurface {
    pub kind: &'static str,
    pub river: Option<usize>,
}

impl GroundSurface {
    fn new(kind: &'static str) -> Self {
        Self { kind, river: None }
    }

    pub fn is_water(&self) -> bool {
        self.kind == "water"
    }
}

/// Who a player spawn is for
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnRequest {
    pub group_id: Option<u8>,
    /// Faction team, 0 outside faction mode
    pub team_id: u8,
    /// Position of the first group member already in the match
    pub anchor: Option<Vec2>,
}

impl SpawnRequest {
    fn is_ally(&self, group_id: u8, team_id: u8) -> bool {
        self.group_id == Some(group_id) || (self.team_id != 0 && self.team_id == team_id)
    }
}

pub struct GameMap {
    pub name: &'static str,
    pub seed: u64,
    pub width: f32,
    pub height: f32,
    pub center: Vec2,
    pub bounds: Aabb,
    pub shore_inset: f32,
    pub grass_inset: f32,
    pub large: bool,
    pub faction_mode: bool,
    /// 0 splits the map horizontally, 1 vertically
    pub split_ori: u8,
    pub terrain: Terrain,
    /// Lakes first, then rivers; indices match `terrain.rivers`
    pub river_descs: Vec<RiverDesc>,
    pub lakes: Vec<Lake>,
    pub places: Vec<PlaceDef>,
    places_to_spawn: Vec<Vec2>,
    place_spawns: Vec<&'static str>,
    object_count: HashMap<&'static str, u32>,
    bridges: Vec<PlacedBridge>,
    emitter_buildings: Vec<EntityId>,
    player_spawn_positions: Vec<Vec2>,
    pub displayed_objects: Vec<MapObjectMsg>,
    pub ground_patches: Vec<GroundPatchMsg>,
}

impl GameMap {
    /// Width and height for a definition at a team size
    pub fn dimensions(def: &MapDef, team_mode: TeamMode) -> (f32, f32) {
        let dims = &def.dimensions;
        let scale = if team_mode.is_large() { dims.scale_large } else { dims.scale_small };
        (
            dims.base_width * scale + dims.extension,
            dims.base_height * scale + dims.extension,
        )
    }

    /// Look up `name` and generate it into `world`
    pub fn generate_named(
        name: &str,
        team_mode: TeamMode,
        seed: u64,
        world: &mut World,
    ) -> Result<GameMap, MapError> {
        let def = map_def(name).ok_or_else(|| MapError::UnknownMap(name.to_string()))?;
        Self::generate(def, team_mode, seed, world)
    }

    /// Build terrain and place every static object. `world` must have been
    /// created with [`GameMap::dimensions`].
    pub fn generate(
        def: &MapDef,
        team_mode: TeamMode,
        seed: u64,
        world: &mut World,
    ) -> Result<GameMap, MapError> {
        let mut rng = SeededRng::new(seed);
        let (width, height) = Self::dimensions(def, team_mode);
        let faction_mode = def.game_mode.faction_mode;
        let split_ori = if faction_mode { rng.int_range(0, 1) as u8 } else { 0 };

        let places_to_spawn = def
            .places
            .iter()
            .map(|p| Vec2::new(p.pos.x * width, (1.0 - p.pos.y) * height))
            .collect();

        let mut map = GameMap {
            name: def.name,
            seed,
            width,
            height,
            center: Vec2::new(width / 2.0, height / 2.0),
            bounds: Aabb::new(Vec2::ZERO, Vec2::new(width, height)),
            shore_inset: def.dimensions.shore_inset,
            grass_inset: def.dimensions.grass_inset,
            large: team_mode.is_large(),
            faction_mode,
            split_ori,
            terrain: Terrain {
                shore: Vec::new(),
                grass: Vec::new(),
                rivers: Vec::new(),
            },
            river_descs: Vec::new(),
            lakes: Vec::new(),
            places: def.places.clone(),
            places_to_spawn,
            place_spawns: def.place_spawns.clone(),
            object_count: HashMap::new(),
            bridges: Vec::new(),
            emitter_buildings: Vec::new(),
            player_spawn_positions: Vec::new(),
            displayed_objects: Vec::new(),
            ground_patches: Vec::new(),
        };

        let mut generator = generate::Generator::new(&mut map, world, def, &mut rng);
        generator.generate_terrain();
        generator.generate_objects()?;

        Ok(map)
    }

    /// How many objects of `type_name` were generated
    pub fn object_count(&self, type_name: &str) -> u32 {
        self.object_count.get(type_name).copied().unwrap_or(0)
    }

    /// Direction the faction split runs across, pointing from team 1 to team 2
    fn faction_dir(&self) -> Vec2 {
        Vec2::from_angle(ori_to_rad(self.split_ori ^ 1))
    }

    pub fn clamp_to_bounds(&self, pos: Vec2, rad: f32) -> Vec2 {
        pos.clamp(
            Vec2::new(rad, rad),
            Vec2::new(self.width - rad, self.height - rad),
        )
    }

    /// Whether `type_name` fits at `pos` without touching placed objects,
    /// breaking bridge rules or landing on water it does not belong in
    pub fn can_spawn(&self, world: &World, type_name: &str, pos: Vec2, ori: u8, scale: f32) -> bool {
        let Some(def) = object_def(type_name) else {
            return false;
        };
        let terrain_rule = def.terrain();
        let is_river = terrain_rule.map(|t| t.river).unwrap_or(false);
        let is_bridge = def.is_bridge();

        let placed = colliders_for(type_name).transform(pos, ori, scale, def.is_building_or_structure());
        let blocked = world
            .query(&placed.grid_bound)
            .filter(|e| e.kind().is_collidable())
            .any(|e| placed.collides_with(e.map_obstacle_bounds(), e.layer()));
        if blocked {
            return false;
        }

        if is_bridge && def.is_building_or_structure() {
            if let Some(own) = colliders::bridge_overlap_bounds(def, pos, ori) {
                let overlaps = self.bridges.iter().any(|other| {
                    object_def(other.type_name)
                        .and_then(|d| colliders::bridge_overlap_bounds(d, other.pos, other.ori))
                        .map(|b| b.intersects(&own))
                        .unwrap_or(false)
                });
                if overlaps {
                    return false;
                }
            }

            for land in def.bridge_land_bounds() {
                let bound = land.transform(pos, ori, 1.0);
                if bound.corners().iter().any(|c| self.is_on_water(world, *c, LAYER_GROUND)) {
                    return false;
                }
            }
            for water in def.bridge_water_bounds() {
                let bound = water.transform(pos, ori, 1.0);
                if !bound.corners().iter().all(|c| self.is_on_water(world, *c, LAYER_GROUND)) {
                    return false;
                }
            }
        }

        if !is_river && !is_bridge {
            let river_shore = terrain_rule.map(|t| t.river_shore).unwrap_or(false);
            let bound = colliders_for(type_name).bounding_aabb().transform(pos, ori, scale);

            for river in &self.terrain.rivers {
                if !bound.intersects(&river.aabb) {
                    continue;
                }
                if !river_shore
                    && (point_in_polygon(pos, &river.shore_poly)
                        || aabb_intersects_polygon(&bound, &river.shore_poly))
                {
                    return false;
                }
                if point_in_polygon(pos, &river.water_poly)
                    || aabb_intersects_polygon(&bound, &river.water_poly)
                {
                    return false;
                }
            }
        }

        if is_river {
            let inset = self.shore_inset / 2.0;
            let inner = Aabb::new(
                Vec2::new(inset, inset),
                Vec2::new(self.width - inset, self.height - inset),
            );
            if !inner.contains_point(pos) {
                return false;
            }
        }

        true
    }

    /// Floor surface of the highest building floor covering `pos`, if any
    fn building_surface(&self, world: &World, objs: &[EntityId], pos: Vec2, layer: u8) -> Option<&'static str> {
        let on_stairs = layer & LAYER_STAIRS != 0;
        let mut surface = None;

        for building in objs.iter().filter_map(|id| world.get(*id)).filter_map(Entity::as_building) {
            // Ground floors win while standing on stairs
            if (building.layer != layer && !on_stairs) || (building.layer == LAYER_BUNKER && on_stairs) {
                continue;
            }
            for s in &building.surfaces {
                if s.colliders.iter().any(|c| c.contains_point(pos)) {
                    surface = Some(s.kind);
                }
            }
        }
        surface
    }

    fn decal_surface(&self, world: &World, objs: &[EntityId], pos: Vec2, layer: u8) -> Option<&'static str> {
        objs.iter()
            .filter_map(|id| world.get(*id))
            .filter_map(Entity::as_decal)
            .filter(|d| same_layer(d.layer, layer))
            .find_map(|d| match (d.surface, d.collider) {
                (Some(surface), Some(collider)) if collider.contains_point(pos) => Some(surface),
                _ => None,
            })
    }

    pub fn ground_surface(&self, world: &World, pos: Vec2, layer: u8) -> GroundSurface {
        let objs = world.grid.query_point(pos);

        if let Some(kind) = self.decal_surface(world, &objs, pos, layer) {
            return GroundSurface::new(kind);
        }
        if let Some(kind) = self.building_surface(world, &objs, pos, layer) {
            return GroundSurface::new(kind);
        }

        let mut on_river_shore = false;
        if layer != LAYER_BUNKER {
            for (i, river) in self.terrain.rivers.iter().enumerate() {
                if river.on_shore(pos) {
                    on_river_shore = true;
                    if point_in_polygon(pos, &river.water_poly) {
                        return GroundSurface {
                            kind: "water",
                            river: Some(i),
                        };
                    }
                }
            }
        }

        if point_in_polygon(pos, &self.terrain.grass) {
            return GroundSurface::new(if on_river_shore { RIVER_SHORE_SURFACE } else { "grass" });
        }
        if point_in_polygon(pos, &self.terrain.shore) {
            return GroundSurface::new("sand");
        }
        GroundSurface::new("water")
    }

    /// Same answer as `ground_surface(..).is_water()`, without classifying land
    pub fn is_on_water(&self, world: &World, pos: Vec2, layer: u8) -> bool {
        let objs = world.grid.query_point(pos);

        if let Some(kind) = self.decal_surface(world, &objs, pos, layer) {
            return kind == "water";
        }
        if let Some(kind) = self.building_surface(world, &objs, pos, layer) {
            return kind == "water";
        }

        if layer != LAYER_BUNKER && self.terrain.rivers.iter().any(|r| r.in_water(pos)) {
            return true;
        }

        !point_in_polygon(pos, &self.terrain.shore)
    }

    /// Safe spawn point for a joining player. Gives up after a bounded number
    /// of attempts and returns the last candidate.
    pub fn spawn_pos(
        &mut self,
        world: &World,
        rng: &mut SeededRng,
        req: &SpawnRequest,
        debug: &DebugConfig,
        outside_safe_zone: impl Fn(Vec2) -> bool,
    ) -> Vec2 {
        if debug.spawn_mode == SpawnMode::Fixed {
            return debug.spawn_pos.unwrap_or(self.center);
        }

        let area = match req.anchor {
            Some(_) => None,
            None => {
                let inset = Aabb::new(
                    Vec2::new(self.shore_inset, self.shore_inset),
                    Vec2::new(self.width - self.shore_inset, self.height - self.shore_inset),
                );
                if self.faction_mode && req.team_id != 0 {
                    let idx = (req.team_id as usize - 1) * (FACTION_DIVISIONS - 1);
                    inset
                        .divide(self.faction_dir(), FACTION_DIVISIONS)
                        .get(idx)
                        .copied()
                        .or(Some(inset))
                } else {
                    Some(inset)
                }
            }
        };

        let mut candidate = self.center;
        for _ in 0..PLAYER_SPAWN_ATTEMPTS {
            candidate = match (req.anchor, area) {
                (Some(anchor), _) => anchor + rng.point_in_circle(TEAMMATE_SPAWN_RADIUS),
                (None, Some(area)) => rng.point_in_aabb(&area),
                (None, None) => self.center,
            };

            if self.spawn_is_safe(world, candidate, req, &outside_safe_zone) {
                self.player_spawn_positions.push(candidate);
                return candidate;
            }
        }

        warn!(map = self.name, "No safe player spawn found, using last candidate");
        candidate
    }

    fn spawn_is_safe(
        &self,
        world: &World,
        pos: Vec2,
        req: &SpawnRequest,
        outside_safe_zone: &impl Fn(Vec2) -> bool,
    ) -> bool {
        if outside_safe_zone(pos) || self.is_on_water(world, pos, LAYER_GROUND) {
            return false;
        }

        let body = Aabb::from_center(pos, PLAYER_RADIUS, PLAYER_RADIUS);
        let blocked = world
            .query(&body)
            .filter(|e| e.layer() == LAYER_GROUND && e.kind().is_collidable())
            .any(|e| {
                e.map_obstacle_bounds()
                    .iter()
                    .any(|c| c.intersects_circle(pos, PLAYER_RADIUS))
            });
        if blocked {
            return false;
        }

        let near_enemy = world
            .iter_kind(EntityKind::Player)
            .filter_map(Entity::as_player)
            .filter(|p| p.is_alive() && !req.is_ally(p.group_id, p.team_id))
            .any(|p| p.pos.distance(pos) < MIN_SPAWN_RAD);
        if near_enemy {
            return false;
        }

        if self
            .player_spawn_positions
            .iter()
            .any(|p| p.distance(pos) < MIN_POS_SPAWN_RAD)
        {
            return false;
        }

        let near_airdrop = world
            .iter_kind(EntityKind::Airdrop)
            .any(|a| a.pos().distance(pos) < AIRDROP_SPAWN_CLEARANCE);
        if near_airdrop {
            return false;
        }

        !world
            .iter_kind(EntityKind::Projectile)
            .filter_map(Entity::as_projectile)
            .filter(|p| p.layer == LAYER_GROUND && !req.is_ally(p.owner_group, p.owner_team))
            .any(|p| p.pos.distance(pos) < PROJECTILE_SPAWN_CLEARANCE)
    }

    /// Recompute which emitter buildings have a living player inside
    pub fn update_occupancy(&self, world: &mut World) {
        let living: Vec<(Vec2, u8)> = world
            .iter_kind(EntityKind::Player)
            .filter_map(Entity::as_player)
            .filter(|p| p.is_alive())
            .map(|p| (p.pos, p.layer))
            .collect();
        let scan_all = living.len() < OCCUPANCY_SCAN_LIMIT;

        for &id in &self.emitter_buildings {
            let Some(building) = world.get(id).and_then(Entity::as_building) else {
                error!(entity_id = id, "Emitter building missing from world");
                continue;
            };

            let inside = |(pos, layer): &(Vec2, u8)| {
                same_layer(*layer, building.layer)
                    && building
                        .zoom_regions
                        .iter()
                        .any(|r| r.intersects_circle(*pos, PLAYER_RADIUS))
            };

            let occupied = if scan_all {
                living.iter().any(inside)
            } else {
                world
                    .query(&building.emitter_bounds)
                    .filter_map(Entity::as_player)
                    .filter(|p| p.is_alive())
                    .map(|p| (p.pos, p.layer))
                    .any(|p| inside(&p))
            };

            if occupied != building.occupied {
                if let Some(b) = world.get_mut(id).and_then(Entity::as_building_mut) {
                    b.occupied = occupied;
                }
                world.mark_part_dirty(id);
            }
        }
    }

    pub fn emitter_buildings(&self) -> &[EntityId] {
        &self.emitter_buildings
    }

    /// Shapes of every placed bridge, for the exclusivity check
    pub fn bridge_overlap_bounds(&self) -> Vec<Aabb> {
        self.bridges
            .iter()
            .filter_map(|b| {
                object_def(b.type_name).and_then(|d| colliders::bridge_overlap_bounds(d, b.pos, b.ori))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Building;
    use crate::game::player::Player;

    fn generated(name: &str, mode: TeamMode, seed: u64) -> (GameMap, World) {
        let def = map_def(name).unwrap();
        let (w, h) = GameMap::dimensions(def, mode);
        let mut world = World::new(w, h);
        let map = GameMap::generate(def, mode, seed, &mut world).unwrap();
        (map, world)
    }

    #[test]
    fn test_unknown_map_is_an_error() {
        let mut world = World::new(100.0, 100.0);
        let err = GameMap::generate_named("atlantis", TeamMode::Solo, 1, &mut world).err();
        assert!(matches!(err, Some(MapError::UnknownMap(_))));
    }

    #[test]
    fn test_dimensions_follow_team_size() {
        let def = map_def("main").unwrap();
        let (solo, _) = GameMap::dimensions(def, TeamMode::Solo);
        let (squad, _) = GameMap::dimensions(def, TeamMode::Squad);
        assert!((solo - (512.0 * 1.1875 + 112.0)).abs() < 1e-3);
        assert!(squad > solo);
    }

    #[test]
    fn test_surfaces_from_center_to_ocean() {
        let (map, world) = generated("main", TeamMode::Solo, 7);
        assert_eq!(map.ground_surface(&world, Vec2::new(1.0, 1.0), 0).kind, "water");
        assert!(map.is_on_water(&world, Vec2::new(1.0, 1.0), 0));

        let beach = Vec2::new(map.shore_inset + map.grass_inset / 2.0, map.center.y);
        let beach_surface = map.ground_surface(&world, beach, 0);
        let objs = world.grid.query_point(beach);
        if map.terrain.rivers.iter().all(|r| !r.on_shore(beach))
            && map.building_surface(&world, &objs, beach, 0).is_none()
        {
            assert_eq!(beach_surface.kind, "sand");
            assert!(!map.is_on_water(&world, beach, 0));
        }
    }

    #[test]
    fn test_river_points_report_water() {
        let (map, world) = generated("main", TeamMode::Solo, 21);
        for river in &map.terrain.rivers {
            let p = river.spline.pos_at(0.5);
            let objs = world.grid.query_point(p);
            if map.building_surface(&world, &objs, p, 0).is_none() {
                let surface = map.ground_surface(&world, p, 0);
                assert!(surface.is_water());
                assert!(surface.river.is_some());
                assert!(map.is_on_water(&world, p, 0));
            }
        }
    }

    #[test]
    fn test_fixed_debug_spawn() {
        let (mut map, world) = generated("main", TeamMode::Solo, 3);
        let mut rng = SeededRng::new(1);
        let debug = DebugConfig {
            spawn_mode: SpawnMode::Fixed,
            spawn_pos: None,
        };
        let pos = map.spawn_pos(&world, &mut rng, &SpawnRequest::default(), &debug, |_| false);
        assert_eq!(pos, map.center);
    }

    #[test]
    fn test_spawns_are_safe_and_spread() {
        let (mut map, world) = generated("main", TeamMode::Solo, 11);
        let mut rng = SeededRng::new(5);
        let debug = DebugConfig::default();

        let mut spawns = Vec::new();
        for group in 1..=10u8 {
            let req = SpawnRequest {
                group_id: Some(group),
                ..SpawnRequest::default()
            };
            spawns.push(map.spawn_pos(&world, &mut rng, &req, &debug, |_| false));
        }

        for (i, pos) in spawns.iter().enumerate() {
            assert!(!map.is_on_water(&world, *pos, 0));
            let body = Aabb::from_center(*pos, PLAYER_RADIUS, PLAYER_RADIUS);
            for e in world.query(&body).filter(|e| e.layer() == 0 && e.kind().is_collidable()) {
                assert!(!e
                    .map_obstacle_bounds()
                    .iter()
                    .any(|c| c.intersects_circle(*pos, PLAYER_RADIUS)));
            }
            for other in &spawns[..i] {
                assert!(other.distance(*pos) >= MIN_POS_SPAWN_RAD);
            }
        }
    }

    #[test]
    fn test_spawn_respects_safe_zone() {
        let (mut map, world) = generated("main", TeamMode::Solo, 13);
        let mut rng = SeededRng::new(8);
        let center = map.center;
        let pos = map.spawn_pos(
            &world,
            &mut rng,
            &SpawnRequest::default(),
            &DebugConfig::default(),
            |p| p.distance(center) > 150.0,
        );
        assert!(pos.distance(center) <= 150.0);
    }

    #[test]
    fn test_occupancy_follows_players() {
        let (map, mut world) = generated("main", TeamMode::Solo, 17);
        let Some(&building_id) = map.emitter_buildings().first() else {
            return;
        };
        let building: Building = world.get(building_id).and_then(Entity::as_building).cloned().unwrap();
        let inside = building.zoom_regions[0].center();

        let player_id = world
            .insert(|id| {
                Entity::Player(Box::new(Player::new(
                    id,
                    uuid::Uuid::new_v4(),
                    "p".into(),
                    1,
                    0,
                    inside,
                )))
            })
            .unwrap();
        world.take_dirty();

        map.update_occupancy(&mut world);
        assert!(world.get(building_id).and_then(Entity::as_building).unwrap().occupied);
        assert!(world.take_dirty().part.contains(&building_id));

        world.remove(player_id);
        map.update_occupancy(&mut world);
        assert!(!world.get(building_id).and_then(Entity::as_building).unwrap().occupied);
    }
}
