//! Terrain generation and static object placement

use tracing::{debug, warn};

use crate::defs::maps::{BridgeTypes, SpawnCount};
use crate::defs::objects::{loot_table, BuildingDef, DecalDef, ObstacleDef, StructureDef};
use crate::defs::{object_def, MapDef, MapObjectDef};
use crate::game::entity::{Building, Decal, Entity, EntityId, Loot, Obstacle, Structure, Surface, LAYER_GROUND};
use crate::game::player::PLAYER_RADIUS;
use crate::game::world::{IdsExhausted, World};
use crate::geom::{add_adjust, ori_to_rad, rad_to_ori, rotate_by_ori, Aabb, Vec2};
use crate::util::rng::SeededRng;

use super::colliders::colliders_for;
use super::terrain::{generate_lake, RiverCreator, RiverDesc, Terrain};
use super::{
    GameMap, GroundPatchMsg, Lake, MapError, MapObjectMsg, PlacedBridge, FACTION_DIVISIONS,
    MAX_SPAWN_ATTEMPTS,
};

const RIVER_TOWN: &str = "river_town_01";
const DOCK: &str = "dock_01";
/// Regrowth attempts for a river that stopped before its second point
const RIVER_RETRIES: usize = 100;
const BRIDGE_ATTEMPTS: usize = 50;
const DENSITY_FACTOR: f32 = 1.35;
/// Objects scattered along every river, as a multiple of its water width
const RIVER_OBJECTS: [(&str, f32); 2] = [("stone_03", 3.0), ("bush_04", 1.2)];
const MAX_RIVER_OBJECTS: f32 = 30.0;
const HUT_EDGE_OFFSET: f32 = 16.0;
/// Faction mode keeps these next to a team's own buildings
const EDGE_OBJECTS: [&str; 3] = ["house_red_01", "barn_01", "warehouse_01"];
/// Faction mode keeps these away from both map edges
const CENTER_OBJECTS: [&str; 2] = ["greenhouse_01", "bunker_structure_01"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeSize {
    Medium,
    Large,
    XLarge,
}

impl BridgeSize {
    fn for_water_width(width: f32) -> Option<Self> {
        if width > 4.0 && width < 9.0 {
            Some(BridgeSize::Medium)
        } else if width > 8.0 && width < 20.0 {
            Some(BridgeSize::Large)
        } else if width > 20.0 {
            Some(BridgeSize::XLarge)
        } else {
            None
        }
    }

    fn max_count(self) -> u32 {
        match self {
            BridgeSize::Medium => 3,
            BridgeSize::Large => 2,
            BridgeSize::XLarge => 0,
        }
    }

    fn type_name(self, types: &BridgeTypes) -> Option<&'static str> {
        match self {
            BridgeSize::Medium => types.medium,
            BridgeSize::Large => types.large,
            BridgeSize::XLarge => types.xlarge,
        }
    }
}

fn bridge_size(map: &GameMap, river: usize) -> Option<BridgeSize> {
    BridgeSize::for_water_width(map.terrain.rivers[river].water_width)
}

/// Width plus half the height of a type's footprint; larger types place first
fn footprint(type_name: &str) -> f32 {
    let bound = colliders_for(type_name).bounding_aabb();
    bound.width() + bound.height() / 2.0
}

fn place_obstacle(
    id: EntityId,
    type_name: &'static str,
    def: &ObstacleDef,
    pos: Vec2,
    layer: u8,
    ori: u8,
    scale: f32,
    parent: Option<EntityId>,
) -> Entity {
    Entity::Obstacle(Obstacle {
        id,
        type_name,
        pos,
        ori,
        scale,
        layer,
        collider: def.collision.transform(pos, ori, scale),
        health: def.health,
        max_health: def.health,
        destructible: def.destructible,
        dead: false,
        parent,
        loot: def.loot,
    })
}

/// Drop the contents of a loot tier at `pos`
pub fn spawn_loot(world: &mut World, tier: &str, pos: Vec2, layer: u8) -> Result<Vec<EntityId>, IdsExhausted> {
    loot_table(tier)
        .iter()
        .map(|&(item, count)| {
            world.insert(|id| {
                Entity::Loot(Loot {
                    id,
                    item,
                    count,
                    pos,
                    layer,
                })
            })
        })
        .collect()
}

fn insert_decal(
    world: &mut World,
    type_name: &'static str,
    def: &DecalDef,
    pos: Vec2,
    layer: u8,
    ori: u8,
    scale: f32,
) -> Result<EntityId, IdsExhausted> {
    world.insert(|id| {
        Entity::Decal(Decal {
            id,
            type_name,
            pos,
            ori,
            scale,
            layer,
            collider: def.collision.map(|c| c.transform(pos, ori, scale)),
        })
    })
}

/// Place a decal by type name; `None` if the type is not a decal
pub fn spawn_decal(
    world: &mut World,
    type_name: &'static str,
    pos: Vec2,
    layer: u8,
) -> Result<Option<EntityId>, IdsExhausted> {
    match object_def(type_name) {
        Some(MapObjectDef::Decal(def)) => insert_decal(world, type_name, def, pos, layer, 0, 1.0).map(Some),
        _ => Ok(None),
    }
}

/// Place an obstacle at full scale outside map generation
pub fn spawn_obstacle(
    world: &mut World,
    type_name: &'static str,
    pos: Vec2,
    layer: u8,
) -> Result<Option<EntityId>, IdsExhausted> {
    match object_def(type_name) {
        Some(MapObjectDef::Obstacle(def)) => world
            .insert(|id| place_obstacle(id, type_name, def, pos, layer, 0, def.scale.max, None))
            .map(Some),
        _ => Ok(None),
    }
}

pub(super) struct Generator<'a> {
    map: &'a mut GameMap,
    world: &'a mut World,
    def: &'a MapDef,
    rng: &'a mut SeededRng,
}

impl<'a> Generator<'a> {
    pub(super) fn new(
        map: &'a mut GameMap,
        world: &'a mut World,
        def: &'a MapDef,
        rng: &'a mut SeededRng,
    ) -> Self {
        Self { map, world, def, rng }
    }

    // ========================================================================
    // Terrain
    // ========================================================================

    pub(super) fn generate_terrain(&mut self) {
        let def = self.def;
        let size = Vec2::new(self.map.width, self.map.height);

        for lake in &def.rivers.lakes {
            let (desc, center) = generate_lake(lake, size, self.rng);
            self.map.lakes.push(Lake {
                river: self.map.river_descs.len(),
                center,
            });
            self.map.river_descs.push(desc);
        }

        let widths = self
            .rng
            .weighted(&def.rivers.weights, |w| w.weight)
            .map(|w| w.widths.clone())
            .unwrap_or_default();
        let creator = RiverCreator::new(self.map.width, self.map.height, &def.rivers.masks);

        for (i, width) in widths.into_iter().enumerate() {
            // The first river of a faction map separates the two teams
            let faction_split = (self.map.faction_mode && i == 0).then_some(self.map.split_ori);

            let points = (0..RIVER_RETRIES)
                .map(|_| creator.create(self.rng, faction_split))
                .find(|points| points.len() >= 2);

            match points {
                Some(points) => self.map.river_descs.push(RiverDesc {
                    width,
                    points,
                    looped: false,
                }),
                None => warn!(map = self.map.name, width, "River never grew past its source, dropping it"),
            }
        }

        self.map.terrain = Terrain::generate(
            self.map.width,
            self.map.height,
            self.map.shore_inset,
            self.map.grass_inset,
            &self.map.river_descs,
            self.rng,
        );
    }

    // ========================================================================
    // Objects
    // ========================================================================

    pub(super) fn generate_objects(&mut self) -> Result<(), MapError> {
        let def = self.def;

        self.gen_location_spawns()?;

        let mut fixed = def.fixed_spawns.clone();
        fixed.sort_by(|a, b| footprint(b.0).total_cmp(&footprint(a.0)));
        fixed.sort_by_key(|(type_name, _)| !def.important_spawns.contains(type_name));

        // Types that carry their own river crossing go before bridges are laid
        let (crossings, fixed): (Vec<_>, Vec<_>) = fixed
            .into_iter()
            .partition(|(type_name, _)| object_def(type_name).map(|d| d.is_bridge()).unwrap_or(false));

        for (type_name, count) in crossings {
            self.gen_fixed(type_name, count)?;
        }

        if !self.map.river_descs.is_empty() {
            self.generate_bridges()?;

            for &(type_name, count) in &def.river_cabins {
                for _ in 0..count {
                    self.gen_river_cabin(type_name)?;
                }
            }

            for (type_name, factor) in RIVER_OBJECTS {
                for river in 0..self.map.terrain.rivers.len() {
                    let amount = (self.map.terrain.rivers[river].water_width * factor).min(MAX_RIVER_OBJECTS);
                    for _ in 0..amount.ceil() as usize {
                        self.gen_on_river(type_name, Some(river))?;
                    }
                }
            }
        }

        for (type_name, count) in fixed {
            self.gen_fixed(type_name, count)?;
        }

        if let Some(random) = def.random_spawns.first() {
            let mut spawns = random.spawns.clone();
            for _ in 0..random.choose {
                if spawns.is_empty() {
                    break;
                }
                let type_name = spawns.remove(self.rng.index(spawns.len()));
                self.gen_from_def(type_name, 1)?;
            }
        }

        for &(type_name, density) in &def.density_spawns {
            let count = (density * DENSITY_FACTOR).round() as u32;
            self.gen_from_def(type_name, count)?;
        }

        debug!(
            map = self.map.name,
            seed = self.map.seed,
            rivers = self.map.river_descs.len(),
            entities = self.world.len(),
            "Map generated"
        );
        Ok(())
    }

    fn resolve_count(&mut self, count: SpawnCount) -> u32 {
        match count {
            SpawnCount::Fixed(n) => n,
            SpawnCount::Scaled { small, large } => {
                if self.map.large {
                    large
                } else {
                    small
                }
            }
            SpawnCount::Odds(odds) => u32::from(self.rng.chance(odds)),
        }
    }

    fn gen_fixed(&mut self, type_name: &'static str, count: SpawnCount) -> Result<(), MapError> {
        let count = self.resolve_count(count);
        if self.map.object_count(type_name) < count {
            self.gen_from_def(type_name, count)?;
        }
        Ok(())
    }

    fn gen_from_def(&mut self, type_name: &'static str, count: u32) -> Result<(), MapError> {
        let Some(rule) = object_def(type_name).and_then(MapObjectDef::terrain) else {
            warn!(type_name, "Map definition names an unplaceable type");
            return Ok(());
        };

        for _ in 0..count {
            if rule.water_edge.is_some() {
                self.gen_on_water_edge(type_name)?;
            } else if rule.river {
                self.gen_on_river(type_name, None)?;
            } else if rule.bridge {
                self.gen_bridge(type_name, None, None)?;
            } else if rule.lake_center {
                self.gen_on_lake_center(type_name)?;
            } else if rule.beach && !rule.grass {
                self.gen_on_beach(type_name)?;
            } else {
                self.gen_on_grass(type_name)?;
            }
        }
        Ok(())
    }

    /// Checks the type and position `gen_auto` will actually create
    fn can_spawn(&self, type_name: &'static str, pos: Vec2, ori: u8, scale: f32) -> bool {
        let type_name = self.def.replacement_for(type_name);
        let pos = self.map.clamp_to_bounds(pos, 0.0);
        self.map.can_spawn(self.world, type_name, pos, ori, scale)
    }

    fn building_ori(&mut self, type_name: &str, def_ori: Option<u8>) -> u8 {
        if self.map.faction_mode && type_name == RIVER_TOWN {
            return self.map.split_ori;
        }
        def_ori.unwrap_or_else(|| self.rng.int_range(0, 3) as u8)
    }

    /// Candidate orientation and scale for a fresh placement
    fn ori_and_scale(&mut self, type_name: &'static str) -> (u8, f32) {
        match object_def(type_name) {
            Some(MapObjectDef::Building(def)) => (self.building_ori(type_name, def.ori), 1.0),
            Some(MapObjectDef::Structure(def)) => (self.building_ori(type_name, def.ori), 1.0),
            _ => (0, self.placement_scale(type_name)),
        }
    }

    /// Scale a placement is both checked and created at
    fn placement_scale(&mut self, type_name: &'static str) -> f32 {
        match object_def(self.def.replacement_for(type_name)) {
            Some(MapObjectDef::Obstacle(def)) => self.rng.range(def.scale.min, def.scale.max),
            _ => 1.0,
        }
    }

    fn gen_location_spawns(&mut self) -> Result<(), MapError> {
        let def = self.def;
        let size = Vec2::new(self.map.width, self.map.height);

        for spawn in &def.location_spawns {
            let center = spawn.pos.mul_elems(size);
            let mut placed = false;
            for _ in 0..MAX_SPAWN_ATTEMPTS {
                let (ori, scale) = self.ori_and_scale(spawn.type_name);
                let pos = center + self.rng.point_in_circle(spawn.rad);
                if self.can_spawn(spawn.type_name, pos, ori, scale) {
                    self.gen_auto(spawn.type_name, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
                    placed = true;
                    break;
                }
            }
            if !placed {
                warn!(map = self.map.name, type_name = spawn.type_name, "Failed to place location spawn");
            }
        }
        Ok(())
    }

    fn gen_on_water_edge(&mut self, type_name: &'static str) -> Result<(), MapError> {
        let Some(def) = object_def(type_name) else {
            return Ok(());
        };
        let Some(edge) = def.terrain().and_then(|t| t.water_edge) else {
            return Ok(());
        };

        let height = colliders_for(type_name).bounding_aabb().height();
        let edge_rot = edge.dir.angle();
        let shore = self.map.shore_inset;

        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let side = match (self.map.faction_mode, def.team_id()) {
                // Team 1 owns the low side of the split, team 2 the high side
                (true, Some(team)) => match (self.map.split_ori, team) {
                    (0, 1) => 3,
                    (0, _) => 1,
                    (_, 1) => 2,
                    _ => 0,
                },
                _ => self.rng.int_range(0, 3) as u8,
            };
            let ori = rad_to_ori(ori_to_rad(side) - edge_rot);

            let mut dist = self.rng.range(edge.dist_min, edge.dist_max);
            if type_name.contains("hut") {
                dist -= HUT_EDGE_OFFSET;
            }

            let min = Vec2::new(shore + dist, shore + height);
            let max = Vec2::new(min.x, self.map.height - shore - height);
            let along = Vec2::new(self.rng.range(min.x, max.x), self.rng.range(min.y, max.y));
            let pos = self.map.center + rotate_by_ori(self.map.center - along, side);

            if self.can_spawn(type_name, pos, ori, 1.0) {
                self.gen_auto(type_name, pos, LAYER_GROUND, Some(ori), Some(1.0), None)?;
                return Ok(());
            }
        }

        warn!(map = self.map.name, type_name, "Failed to place object on the water edge");
        Ok(())
    }

    /// Area a grass type is sampled from; faction maps pin some types to bands
    fn grass_area(&mut self, type_name: &str, def: &MapObjectDef, spawn: Aabb) -> Aabb {
        if !self.map.faction_mode {
            return spawn;
        }

        let outermost = FACTION_DIVISIONS - 1;
        let division = if let Some(team) = def.team_id() {
            usize::from(team.saturating_sub(1)) * outermost
        } else if EDGE_OBJECTS.contains(&type_name) {
            (self.rng.int_range(1, 2) as usize - 1) * outermost
        } else if CENTER_OBJECTS.contains(&type_name) {
            self.rng.int_range(1, FACTION_DIVISIONS as i32 - 2) as usize
        } else {
            return spawn;
        };

        spawn
            .divide(self.map.faction_dir(), FACTION_DIVISIONS)
            .get(division)
            .copied()
            .unwrap_or(spawn)
    }

    fn gen_on_grass(&mut self, type_name: &'static str) -> Result<(), MapError> {
        let Some(def) = object_def(type_name) else {
            return Ok(());
        };

        let bounds = colliders_for(type_name).bounding_aabb();
        let (mut width, mut height) = (bounds.width(), bounds.height());
        if !def.terrain().map(|t| t.beach).unwrap_or(false) {
            width += self.map.grass_inset;
            height += self.map.grass_inset;
        }

        let shore = self.map.shore_inset;
        let spawn_min = Vec2::new(shore + width, shore + height);
        let spawn_max = Vec2::new(self.map.width - shore - width, self.map.height - shore - height);
        let spawn = Aabb::new(spawn_min, spawn_max);

        let (_, scale) = self.ori_and_scale(type_name);
        let near_place = !self.map.places_to_spawn.is_empty() && self.map.place_spawns.contains(&type_name);

        for attempt in 0..MAX_SPAWN_ATTEMPTS {
            let (ori, _) = self.ori_and_scale(type_name);

            let mut place = None;
            let pos = if near_place {
                let idx = self.rng.index(self.map.places_to_spawn.len());
                place = Some(idx);
                // Search outward from the place as attempts fail
                let spread = Vec2::new(width + attempt as f32 * 2.0, height + attempt as f32 * 2.0);
                let offset = (self.rng.unit_vec() * 0.5).mul_elems(spread);
                (self.map.places_to_spawn[idx] + offset).clamp(spawn_min, spawn_max)
            } else {
                let area = self.grass_area(type_name, def, spawn);
                self.rng.point_in_aabb(&area)
            };

            if self.can_spawn(type_name, pos, ori, scale) {
                self.gen_auto(type_name, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
                if let Some(idx) = place {
                    self.map.places_to_spawn.remove(idx);
                    if let Some(i) = self.map.place_spawns.iter().position(|t| *t == type_name) {
                        self.map.place_spawns.remove(i);
                    }
                }
                return Ok(());
            }
        }

        warn!(map = self.map.name, type_name, "Failed to place object on grass");
        Ok(())
    }

    fn gen_on_beach(&mut self, type_name: &'static str) -> Result<(), MapError> {
        let bounds = colliders_for(type_name).bounding_aabb();
        let (width, height) = (bounds.width(), bounds.height());
        let (ori, scale) = self.ori_and_scale(type_name);
        let shore = self.map.shore_inset;

        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let side = self.rng.int_range(0, 3) as u8;
            let min = Vec2::new(shore + width, shore + width + self.map.grass_inset);
            let max = Vec2::new(min.x, self.map.height - shore - height);
            let along = Vec2::new(self.rng.range(min.x, max.x), self.rng.range(min.y, max.y));
            let pos = self.map.center + rotate_by_ori(self.map.center - along, side);

            if self.can_spawn(type_name, pos, ori, scale) {
                self.gen_auto(type_name, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
                return Ok(());
            }
        }

        warn!(map = self.map.name, type_name, "Failed to place object on the beach");
        Ok(())
    }

    fn generate_bridges(&mut self) -> Result<(), MapError> {
        let def = self.def;
        let types = &def.bridge_types;

        if self.map.faction_mode && self.map.object_count(RIVER_TOWN) > 0 {
            // The town crossing is flanked by one extra large bridge on each side
            if let Some(xlarge) = types.xlarge {
                self.gen_bridge(xlarge, Some(0), Some(0.25))?;
                self.gen_bridge(xlarge, Some(0), Some(0.75))?;
            }
            return Ok(());
        }

        let wanted = self.rng.int_range(0, 3);
        if wanted == 0 {
            return Ok(());
        }

        let mut candidates: Vec<usize> = (0..self.map.terrain.rivers.len())
            .filter(|&i| !self.map.terrain.rivers[i].looped)
            .filter(|&i| bridge_size(self.map, i).map(|s| s.max_count() > 0).unwrap_or(false))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let mut placed = [0u32; 3];
        for _ in 0..wanted {
            let river = candidates[self.rng.index(candidates.len())];
            let Some(size) = bridge_size(self.map, river) else {
                continue;
            };
            let Some(bridge_type) = size.type_name(types) else {
                continue;
            };

            for _ in 0..BRIDGE_ATTEMPTS {
                if !self.gen_bridge(bridge_type, Some(river), None)? {
                    continue;
                }
                placed[size as usize] += 1;
                if placed[size as usize] >= size.max_count() {
                    candidates.retain(|&i| bridge_size(self.map, i) != Some(size));
                    if candidates.is_empty() {
                        return Ok(());
                    }
                }
                break;
            }
        }
        Ok(())
    }

    /// Place a river crossing. `progress` pins the position along the river,
    /// with a little jitter so a blocked exact spot cannot fail every attempt.
    fn gen_bridge(
        &mut self,
        type_name: &'static str,
        river: Option<usize>,
        progress: Option<f32>,
    ) -> Result<bool, MapError> {
        let river_count = self.map.terrain.rivers.len();
        if river_count == 0 {
            return Ok(false);
        }
        let nearby = object_def(type_name)
            .and_then(MapObjectDef::terrain)
            .and_then(|t| t.nearby_river);

        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let (_, scale) = self.ori_and_scale(type_name);

            let t = match progress {
                Some(p) => self.rng.range(p - 0.08, p + 0.08).clamp(0.0, 1.0),
                None if type_name == RIVER_TOWN => self.rng.range(0.45, 0.55),
                None => self.rng.range(0.0, 1.0),
            };
            let idx = if type_name == RIVER_TOWN {
                0
            } else {
                river.unwrap_or_else(|| self.rng.index(river_count))
            };

            let spline = &self.map.terrain.rivers[idx].spline;
            let water_width = self.map.terrain.rivers[idx].water_width;
            let mut pos = spline.pos_at(t);
            let mut ori = match nearby {
                Some(nearby) => {
                    let other_side = self.rng.chance(0.5);
                    let side = if other_side { -1.0 } else { 1.0 };
                    pos = pos + spline.normal_at(t) * (water_width * 2.0 * side);

                    let normal = spline.normal_at(spline.closest_t(pos));
                    let river_ori = (rad_to_ori(normal.angle()) + if other_side { 2 } else { 0 }) % 4;
                    (nearby.facing_ori + river_ori) % 4
                }
                None => rad_to_ori(spline.normal_at(t).angle()),
            };
            if type_name == RIVER_TOWN {
                ori = self.map.split_ori ^ 1;
            }

            if self.can_spawn(type_name, pos, ori, scale) {
                self.gen_auto(type_name, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
                self.map.bridges.push(PlacedBridge { type_name, pos, ori });
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Single attempt at scattering a river object
    fn gen_on_river(&mut self, type_name: &'static str, river: Option<usize>) -> Result<(), MapError> {
        let river_count = self.map.terrain.rivers.len();
        if river_count == 0 {
            return Ok(());
        }
        let idx = river.unwrap_or_else(|| self.rng.index(river_count));

        let t = self.rng.range(0.0, 1.0);
        let offset = self.rng.range(0.0, self.map.terrain.rivers[idx].water_width);
        let pos = self.map.terrain.rivers[idx].spline.pos_at(t) + self.rng.unit_vec() * offset;
        let scale = self.placement_scale(type_name);

        if self.can_spawn(type_name, pos, 0, scale) {
            self.gen_auto(type_name, pos, LAYER_GROUND, Some(0), Some(scale), None)?;
        }
        Ok(())
    }

    fn gen_river_cabin(&mut self, type_name: &'static str) -> Result<(), MapError> {
        let river_count = self.map.terrain.rivers.len();
        let Some(nearby) = object_def(type_name)
            .and_then(MapObjectDef::terrain)
            .and_then(|t| t.nearby_river)
        else {
            warn!(type_name, "River cabin type has no river facing");
            return Ok(());
        };
        if river_count == 0 {
            return Ok(());
        }

        let inset = self.map.grass_inset + self.map.shore_inset;
        let inner = Aabb::new(
            Vec2::new(inset, inset),
            Vec2::new(self.map.width - inset, self.map.height - inset),
        );
        let bound = colliders_for(type_name).bounding_aabb();
        let height = bound.height();

        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let t = self.rng.range(0.1, 0.9);
            let idx = self.rng.index(river_count);
            let other_side = self.rng.chance(0.5);
            let side = if other_side { -1.0 } else { 1.0 };

            let river = &self.map.terrain.rivers[idx];
            let pos = river.spline.pos_at(t) + river.spline.normal_at(t) * ((river.water_width + height) * side);
            let normal = river.spline.normal_at(river.spline.closest_t(pos));
            let river_ori = (rad_to_ori(normal.angle()) + if other_side { 2 } else { 0 }) % 4;
            let ori = (nearby.facing_ori + river_ori) % 4;

            if !inner.contains_aabb(&bound.transform(pos, ori, 1.0)) {
                continue;
            }
            let scale = self.placement_scale(type_name);
            if !self.can_spawn(type_name, pos, ori, scale) {
                continue;
            }

            self.gen_auto(type_name, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
            self.gen_cabin_dock(idx, pos, ori, other_side)?;
            return Ok(());
        }

        warn!(map = self.map.name, type_name, "Failed to place river cabin");
        Ok(())
    }

    fn gen_cabin_dock(&mut self, river: usize, cabin_pos: Vec2, ori: u8, other_side: bool) -> Result<(), MapError> {
        let side = if other_side { -1.0 } else { 1.0 };
        let closest = self.map.terrain.rivers[river].spline.closest_t(cabin_pos);

        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let t = closest + self.rng.range(-0.02, 0.02);
            let r = &self.map.terrain.rivers[river];
            let pos = r.spline.pos_at(t) + r.spline.normal_at(t) * (r.water_width * side);

            let scale = self.placement_scale(DOCK);
            if self.can_spawn(DOCK, pos, ori, scale) {
                self.gen_auto(DOCK, pos, LAYER_GROUND, Some(ori), Some(scale), None)?;
                return Ok(());
            }
        }

        warn!(map = self.map.name, "Failed to place cabin dock");
        Ok(())
    }

    fn gen_on_lake_center(&mut self, type_name: &'static str) -> Result<(), MapError> {
        if self.map.lakes.is_empty() {
            warn!(map = self.map.name, type_name, "Lake center type on a map without lakes");
            return Ok(());
        }
        let center = self.map.lakes[self.rng.index(self.map.lakes.len())].center;
        let scale = self.placement_scale(type_name);
        if !self.can_spawn(type_name, center, 0, scale) {
            warn!(map = self.map.name, type_name, "Lake center is taken");
            return Ok(());
        }
        self.gen_auto(type_name, center, LAYER_GROUND, Some(0), Some(scale), None)?;
        Ok(())
    }

    // ========================================================================
    // Instantiation
    // ========================================================================

    fn count(&mut self, type_name: &'static str) {
        *self.map.object_count.entry(type_name).or_insert(0) += 1;
    }

    /// Create the world entities for `type_name`, recursing into children
    /// and structure layers. Loot spawners produce loot and return `None`.
    fn gen_auto(
        &mut self,
        type_name: &'static str,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
        scale: Option<f32>,
        parent: Option<EntityId>,
    ) -> Result<Option<EntityId>, MapError> {
        let type_name = self.def.replacement_for(type_name);
        let pos = self.map.clamp_to_bounds(pos, 0.0);

        let Some(def) = object_def(type_name) else {
            warn!(type_name, "Unknown map object type");
            return Ok(None);
        };

        let id = match def {
            MapObjectDef::Obstacle(obstacle) => {
                Some(self.gen_obstacle(type_name, obstacle, pos, layer, ori, scale, parent)?)
            }
            MapObjectDef::Building(building) => {
                Some(self.gen_building(type_name, building, pos, layer, ori, parent)?)
            }
            MapObjectDef::Structure(structure) => {
                Some(self.gen_structure(type_name, structure, pos, layer, ori)?)
            }
            MapObjectDef::Decal(decal) => Some(insert_decal(
                self.world,
                type_name,
                decal,
                pos,
                layer,
                ori.unwrap_or(0),
                scale.unwrap_or(1.0),
            )?),
            MapObjectDef::LootSpawner { tier } => {
                spawn_loot(self.world, tier, pos, layer)?;
                None
            }
        };
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn gen_obstacle(
        &mut self,
        type_name: &'static str,
        def: &ObstacleDef,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
        scale: Option<f32>,
        parent: Option<EntityId>,
    ) -> Result<EntityId, MapError> {
        let scale = scale.unwrap_or_else(|| self.rng.range(def.scale.min, def.scale.max));
        let ori = ori.unwrap_or(0);

        let id = self
            .world
            .insert(|id| place_obstacle(id, type_name, def, pos, layer, ori, scale, parent))?;

        if def.map_display && layer == LAYER_GROUND {
            self.map.displayed_objects.push(MapObjectMsg {
                type_name,
                pos,
                ori,
                scale,
            });
        }
        self.count(type_name);
        Ok(id)
    }

    fn gen_building(
        &mut self,
        type_name: &'static str,
        def: &BuildingDef,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
        parent: Option<EntityId>,
    ) -> Result<EntityId, MapError> {
        let ori = ori.or(def.ori).unwrap_or_else(|| self.rng.int_range(0, 3) as u8);

        let map_obstacle_bounds = def
            .map_obstacle_bounds
            .iter()
            .map(|c| c.transform(pos, ori, 1.0))
            .collect();
        let surfaces = def
            .floor_surfaces
            .iter()
            .map(|s| Surface {
                kind: s.kind,
                colliders: s.collision.iter().map(|c| c.transform(pos, ori, 1.0)).collect(),
            })
            .collect();
        let zoom_regions: Vec<Aabb> = def.zoom_regions.iter().map(|z| z.transform(pos, ori, 1.0)).collect();
        let emitter_bounds = Aabb::bounding(&zoom_regions)
            .map(|b| b.expand(PLAYER_RADIUS))
            .unwrap_or_else(|| Aabb::from_center(pos, 1.0, 1.0));

        let id = self.world.insert(|id| {
            Entity::Building(Building {
                id,
                type_name,
                pos,
                ori,
                layer,
                map_obstacle_bounds,
                surfaces,
                zoom_regions,
                emitter_bounds,
                has_emitters: def.occupied_emitters,
                occupied: false,
                children: Vec::new(),
                parent,
            })
        })?;

        if def.occupied_emitters {
            self.map.emitter_buildings.push(id);
        }
        if def.map_display && layer == LAYER_GROUND {
            self.map.displayed_objects.push(MapObjectMsg {
                type_name,
                pos,
                ori,
                scale: 1.0,
            });
        }

        let mut children = Vec::with_capacity(def.children.len());
        for child in &def.children {
            let child_ori = if child.inherit_ori { (child.ori + ori) % 4 } else { child.ori };
            let child_pos = add_adjust(pos, child.pos, ori);
            if let Some(child_id) =
                self.gen_auto(child.type_name, child_pos, layer, Some(child_ori), Some(child.scale), Some(id))?
            {
                children.push(child_id);
            }
        }
        if let Some(building) = self.world.get_mut(id).and_then(Entity::as_building_mut) {
            building.children = children;
        }

        for patch in &def.ground_patches {
            self.map.ground_patches.push(GroundPatchMsg {
                bound: patch.bound.transform(pos, ori, 1.0),
                color: patch.color,
            });
        }

        self.count(type_name);
        Ok(id)
    }

    /// Structures own one building per layer; layer 0 is above ground
    fn gen_structure(
        &mut self,
        type_name: &'static str,
        def: &StructureDef,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
    ) -> Result<EntityId, MapError> {
        let ori = ori.or(def.ori).unwrap_or_else(|| self.rng.int_range(0, 3) as u8);
        let map_obstacle_bounds = def
            .map_obstacle_bounds
            .iter()
            .map(|c| c.transform(pos, ori, 1.0))
            .collect();

        let id = self.world.insert(|id| {
            Entity::Structure(Structure {
                id,
                type_name,
                pos,
                ori,
                layer,
                map_obstacle_bounds,
                layer_ids: Vec::new(),
            })
        })?;

        let mut layer_ids = Vec::with_capacity(def.layers.len());
        for (i, layer_def) in def.layers.iter().enumerate() {
            let Some(MapObjectDef::Building(building)) = object_def(layer_def.type_name) else {
                warn!(type_name, layer = layer_def.type_name, "Structure layer is not a building");
                continue;
            };
            let layer_id = self.gen_building(
                layer_def.type_name,
                building,
                add_adjust(pos, layer_def.pos, ori),
                i as u8,
                Some((layer_def.ori + ori) % 4),
                Some(id),
            )?;
            layer_ids.push(layer_id);
        }
        if let Some(Entity::Structure(structure)) = self.world.get_mut(id) {
            structure.layer_ids = layer_ids;
        }

        self.count(type_name);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{map_def, TeamMode};
    use crate::game::entity::EntityKind;

    fn generated(def: &MapDef, mode: TeamMode, seed: u64) -> (GameMap, World) {
        let (w, h) = GameMap::dimensions(def, mode);
        let mut world = World::new(w, h);
        let map = GameMap::generate(def, mode, seed, &mut world).unwrap();
        (map, world)
    }

    fn snapshot(world: &World) -> Vec<(EntityKind, &'static str, i32, i32)> {
        let mut out = Vec::new();
        for kind in EntityKind::ALL {
            for e in world.iter_kind(kind) {
                let name = match e {
                    Entity::Obstacle(o) => o.type_name,
                    Entity::Building(b) => b.type_name,
                    Entity::Structure(s) => s.type_name,
                    Entity::Loot(l) => l.item,
                    _ => "",
                };
                let pos = e.pos();
                out.push((kind, name, (pos.x * 100.0) as i32, (pos.y * 100.0) as i32));
            }
        }
        out
    }

    #[test]
    fn test_generation_is_deterministic() {
        let def = map_def("main").unwrap();
        let (map_a, world_a) = generated(def, TeamMode::Solo, 1234);
        let (map_b, world_b) = generated(def, TeamMode::Solo, 1234);

        assert_eq!(map_a.river_descs, map_b.river_descs);
        assert_eq!(snapshot(&world_a), snapshot(&world_b));
        assert_eq!(map_a.displayed_objects, map_b.displayed_objects);
    }

    #[test]
    fn test_top_level_objects_stay_on_the_map() {
        let def = map_def("main").unwrap();
        let (map, world) = generated(def, TeamMode::Duo, 8);
        for kind in [EntityKind::Building, EntityKind::Structure, EntityKind::Obstacle] {
            for e in world.iter_kind(kind) {
                assert!(map.bounds.contains_point(e.pos()), "{} at {:?}", e.id(), e.pos());
            }
        }
        assert!(map.object_count("warehouse_01") <= 4);
    }

    #[test]
    fn test_bridges_are_exclusive() {
        let def = map_def("main").unwrap();
        for seed in 0..6 {
            let (map, _) = generated(def, TeamMode::Solo, seed);
            let bounds = map.bridge_overlap_bounds();
            for (i, a) in bounds.iter().enumerate() {
                for b in &bounds[i + 1..] {
                    assert!(!a.intersects(b), "seed {seed}: bridges overlap");
                }
            }
        }
    }

    /// Object a generated entity belongs to; building parts share their root
    fn root_of(world: &World, mut id: EntityId) -> EntityId {
        loop {
            let parent = match world.get(id) {
                Some(Entity::Obstacle(o)) => o.parent,
                Some(Entity::Building(b)) => b.parent,
                _ => None,
            };
            match parent {
                Some(parent) => id = parent,
                None => return id,
            }
        }
    }

    #[test]
    fn test_placed_objects_never_overlap() {
        let cases = [
            ("main", TeamMode::Solo, 0..3u64),
            ("main", TeamMode::Squad, 0..2),
            ("faction", TeamMode::Squad, 0..2),
        ];

        for (map_name, mode, seeds) in cases {
            let def = map_def(map_name).unwrap();
            for seed in seeds {
                let (_, world) = generated(def, mode, seed);
                let placed: Vec<(&Entity, EntityId)> = [EntityKind::Obstacle, EntityKind::Building, EntityKind::Structure]
                    .into_iter()
                    .flat_map(|kind| world.iter_kind(kind))
                    .map(|e| (e, root_of(&world, e.id())))
                    .collect();

                for (i, (a, root_a)) in placed.iter().enumerate() {
                    for (b, root_b) in &placed[i + 1..] {
                        if root_a == root_b || a.layer() != b.layer() {
                            continue;
                        }
                        let overlap = a
                            .map_obstacle_bounds()
                            .iter()
                            .any(|ca| b.map_obstacle_bounds().iter().any(|cb| ca.intersects(cb)));
                        assert!(
                            !overlap,
                            "{map_name}/{mode:?}/seed {seed}: {:?} #{} overlaps {:?} #{}",
                            a.kind(),
                            a.id(),
                            b.kind(),
                            b.id()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_wide_rivers_get_no_xlarge_bridges() {
        let mut def = map_def("main").unwrap().clone();
        def.rivers.weights = vec![crate::defs::maps::RiverWeight {
            weight: 1.0,
            widths: vec![24.0, 22.0],
        }];
        for seed in 0..4 {
            let (map, _) = generated(&def, TeamMode::Solo, seed);
            assert_eq!(map.object_count("bridge_xlg_structure"), 0);
        }
    }

    #[test]
    fn test_river_objects_scale_with_width() {
        let def = map_def("main").unwrap();
        let (map, _) = generated(def, TeamMode::Solo, 99);
        if map.terrain.rivers.is_empty() {
            return;
        }
        let cap: f32 = map
            .terrain
            .rivers
            .iter()
            .map(|r| (r.water_width * 3.0).min(MAX_RIVER_OBJECTS).ceil())
            .sum();
        assert!(map.object_count("stone_03") as f32 <= cap);
    }

    #[test]
    fn test_lakes_come_before_rivers() {
        let def = map_def("main_spring").unwrap();
        let (map, _) = generated(def, TeamMode::Solo, 5);
        assert_eq!(map.lakes.len(), 1);
        assert_eq!(map.lakes[0].river, 0);
        assert!(map.river_descs[0].looped);
        assert!(map.river_descs[1..].iter().all(|r| !r.looped));
        assert_eq!(map.object_count("lake_island_01"), 1);
        assert_eq!(map.object_count("tree_01"), 0);
        assert!(map.object_count("tree_07sp") > 0);
    }

    #[test]
    fn test_faction_map_keeps_team_buildings_on_their_side() {
        let def = map_def("faction").unwrap();
        let (map, world) = generated(def, TeamMode::Squad, 77);
        let axis = |p: Vec2| if map.split_ori == 0 { p.y } else { p.x };
        let half = if map.split_ori == 0 { map.height / 2.0 } else { map.width / 2.0 };

        for b in world.iter_kind(EntityKind::Building).filter_map(Entity::as_building) {
            match b.type_name {
                "outpost_red_01" => assert!(axis(b.pos) < half),
                "outpost_blue_01" => assert!(axis(b.pos) > half),
                _ => {}
            }
        }
    }

    #[test]
    fn test_structures_own_their_layers() {
        let def = map_def("faction").unwrap();
        let (_, world) = generated(def, TeamMode::Squad, 4);
        for s in world.iter_kind(EntityKind::Structure).filter_map(Entity::as_structure) {
            for (layer, id) in s.layer_ids.iter().enumerate() {
                let b = world.get(*id).and_then(Entity::as_building).unwrap();
                assert_eq!(b.layer as usize, layer);
                assert_eq!(b.parent, Some(s.id));
            }
        }
    }

    #[test]
    fn test_spawn_helpers() {
        let mut world = World::new(64.0, 64.0);
        let loot = spawn_loot(&mut world, "tier_airdrop", Vec2::new(10.0, 10.0), 0).unwrap();
        assert_eq!(loot.len(), 3);
        assert!(spawn_decal(&mut world, "decal_blood_01", Vec2::new(5.0, 5.0), 0)
            .unwrap()
            .is_some());
        assert!(spawn_decal(&mut world, "tree_01", Vec2::new(5.0, 5.0), 0).unwrap().is_none());
        assert!(spawn_obstacle(&mut world, "airdrop_crate_01", Vec2::new(20.0, 20.0), 0)
            .unwrap()
            .is_some());
    }
}
