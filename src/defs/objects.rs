//! Map object catalog
//!
//! Every placeable type is looked up by name. Geometry is in the object's
//! local frame; placement turns it by quarter-turn orientations.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::geom::{Aabb, Collider, Vec2};

#[derive(Debug, Clone, Copy)]
pub struct ScaleRange {
    pub min: f32,
    pub max: f32,
}

impl ScaleRange {
    pub const ONE: ScaleRange = ScaleRange { min: 1.0, max: 1.0 };
}

/// Placement of a building along the map edge facing the ocean
#[derive(Debug, Clone, Copy)]
pub struct WaterEdge {
    pub dir: Vec2,
    pub dist_min: f32,
    pub dist_max: f32,
}

/// Placement next to a river, turned to face it
#[derive(Debug, Clone, Copy)]
pub struct NearbyRiver {
    pub facing_ori: u8,
}

/// Where an object may be generated
#[derive(Debug, Clone, Default)]
pub struct TerrainRule {
    pub grass: bool,
    pub beach: bool,
    /// May overlap a river's shore band
    pub river_shore: bool,
    /// Placed inside rivers
    pub river: bool,
    pub lake_center: bool,
    /// Spans a river; checked with land/water sub-bounds
    pub bridge: bool,
    pub water_edge: Option<WaterEdge>,
    pub nearby_river: Option<NearbyRiver>,
}

#[derive(Debug, Clone)]
pub struct ObstacleDef {
    pub collision: Collider,
    pub scale: ScaleRange,
    pub health: f32,
    pub destructible: bool,
    /// Loot tier dropped when destroyed
    pub loot: Option<&'static str>,
    pub map_display: bool,
    pub terrain: TerrainRule,
}

#[derive(Debug, Clone)]
pub struct ChildObject {
    pub type_name: &'static str,
    pub pos: Vec2,
    pub scale: f32,
    pub ori: u8,
    pub inherit_ori: bool,
}

#[derive(Debug, Clone)]
pub struct FloorSurface {
    pub kind: &'static str,
    pub collision: Vec<Collider>,
}

#[derive(Debug, Clone, Copy)]
pub struct GroundPatch {
    pub bound: Aabb,
    pub color: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BuildingDef {
    pub map_obstacle_bounds: Vec<Collider>,
    pub children: Vec<ChildObject>,
    pub floor_surfaces: Vec<FloorSurface>,
    /// Ceiling regions; a player inside one counts as inside the building
    pub zoom_regions: Vec<Aabb>,
    pub ground_patches: Vec<GroundPatch>,
    pub bridge_land_bounds: Vec<Aabb>,
    pub bridge_water_bounds: Vec<Aabb>,
    /// Smoke emitters that only run while the building is occupied
    pub occupied_emitters: bool,
    pub team_id: Option<u8>,
    pub ori: Option<u8>,
    pub map_display: bool,
    pub terrain: TerrainRule,
}

#[derive(Debug, Clone)]
pub struct StructureLayer {
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
}

#[derive(Debug, Clone, Default)]
pub struct StructureDef {
    pub map_obstacle_bounds: Vec<Collider>,
    /// Layer 0 is above ground, the rest are bunker layers
    pub layers: Vec<StructureLayer>,
    pub bridge_land_bounds: Vec<Aabb>,
    pub bridge_water_bounds: Vec<Aabb>,
    pub ori: Option<u8>,
    pub terrain: TerrainRule,
}

#[derive(Debug, Clone)]
pub struct DecalDef {
    pub collision: Option<Collider>,
}

#[derive(Debug, Clone)]
pub enum MapObjectDef {
    Obstacle(ObstacleDef),
    Building(BuildingDef),
    Structure(StructureDef),
    LootSpawner { tier: &'static str },
    Decal(DecalDef),
}

impl MapObjectDef {
    pub fn terrain(&self) -> Option<&TerrainRule> {
        match self {
            MapObjectDef::Obstacle(d) => Some(&d.terrain),
            MapObjectDef::Building(d) => Some(&d.terrain),
            MapObjectDef::Structure(d) => Some(&d.terrain),
            MapObjectDef::LootSpawner { .. } | MapObjectDef::Decal(_) => None,
        }
    }

    pub fn team_id(&self) -> Option<u8> {
        match self {
            MapObjectDef::Building(d) => d.team_id,
            _ => None,
        }
    }

    pub fn is_building_or_structure(&self) -> bool {
        matches!(self, MapObjectDef::Building(_) | MapObjectDef::Structure(_))
    }

    pub fn is_bridge(&self) -> bool {
        self.terrain().map(|t| t.bridge).unwrap_or(false)
    }

    pub fn bridge_land_bounds(&self) -> &[Aabb] {
        match self {
            MapObjectDef::Building(d) => &d.bridge_land_bounds,
            MapObjectDef::Structure(d) => &d.bridge_land_bounds,
            _ => &[],
        }
    }

    pub fn bridge_water_bounds(&self) -> &[Aabb] {
        match self {
            MapObjectDef::Building(d) => &d.bridge_water_bounds,
            MapObjectDef::Structure(d) => &d.bridge_water_bounds,
            _ => &[],
        }
    }
}

static CATALOG: OnceLock<HashMap<&'static str, MapObjectDef>> = OnceLock::new();

pub fn object_def(name: &str) -> Option<&'static MapObjectDef> {
    catalog().get(name)
}

/// Definition together with its interned name
pub fn object_def_entry(name: &str) -> Option<(&'static str, &'static MapObjectDef)> {
    catalog().get_key_value(name).map(|(k, v)| (*k, v))
}

fn catalog() -> &'static HashMap<&'static str, MapObjectDef> {
    CATALOG.get_or_init(build_catalog)
}

fn rect(hw: f32, hh: f32) -> Collider {
    Collider::aabb(Vec2::new(-hw, -hh), Vec2::new(hw, hh))
}

fn aabb(x0: f32, y0: f32, x1: f32, y1: f32) -> Aabb {
    Aabb::new(Vec2::new(x0, y0), Vec2::new(x1, y1))
}

fn circle(rad: f32) -> Collider {
    Collider::circle(Vec2::ZERO, rad)
}

fn child(type_name: &'static str, x: f32, y: f32) -> ChildObject {
    ChildObject {
        type_name,
        pos: Vec2::new(x, y),
        scale: 1.0,
        ori: 0,
        inherit_ori: true,
    }
}

fn obstacle(collision: Collider, scale: ScaleRange, health: f32) -> ObstacleDef {
    ObstacleDef {
        collision,
        scale,
        health,
        destructible: true,
        loot: None,
        map_display: false,
        terrain: TerrainRule {
            grass: true,
            ..TerrainRule::default()
        },
    }
}

fn floor(kind: &'static str, hw: f32, hh: f32) -> FloorSurface {
    FloorSurface {
        kind,
        collision: vec![rect(hw, hh)],
    }
}

/// Bridge spanning a river along its local x axis
fn bridge(len: f32, land: (f32, f32), water: f32) -> (StructureDef, BuildingDef) {
    let half = len / 2.0;
    let deck = BuildingDef {
        floor_surfaces: vec![floor("bridge", half, 4.0)],
        map_display: true,
        ..BuildingDef::default()
    };

    let structure = StructureDef {
        map_obstacle_bounds: vec![rect(half, 5.0)],
        layers: Vec::new(),
        bridge_land_bounds: vec![
            aabb(-land.1, -3.0, -land.0, 3.0),
            aabb(land.0, -3.0, land.1, 3.0),
        ],
        bridge_water_bounds: vec![aabb(-water, -3.0, water, 3.0)],
        ori: None,
        terrain: TerrainRule {
            bridge: true,
            ..TerrainRule::default()
        },
    };
    (structure, deck)
}

fn build_catalog() -> HashMap<&'static str, MapObjectDef> {
    use MapObjectDef::*;

    let mut defs: HashMap<&'static str, MapObjectDef> = HashMap::new();

    // ------------------------------------------------------------------
    // Obstacles
    // ------------------------------------------------------------------

    let tree = ObstacleDef {
        map_display: true,
        ..obstacle(circle(1.6), ScaleRange { min: 0.9, max: 1.2 }, 175.0)
    };
    defs.insert("tree_01", Obstacle(tree.clone()));
    defs.insert("tree_07sp", Obstacle(tree));

    defs.insert(
        "stone_01",
        Obstacle(ObstacleDef {
            map_display: true,
            ..obstacle(circle(1.6), ScaleRange { min: 0.8, max: 1.2 }, 250.0)
        }),
    );
    defs.insert(
        "stone_03",
        Obstacle(ObstacleDef {
            terrain: TerrainRule {
                river: true,
                ..TerrainRule::default()
            },
            ..obstacle(circle(1.8), ScaleRange { min: 0.8, max: 1.2 }, 250.0)
        }),
    );
    defs.insert(
        "bush_01",
        Obstacle(obstacle(circle(1.4), ScaleRange { min: 0.9, max: 1.1 }, 80.0)),
    );
    defs.insert(
        "bush_04",
        Obstacle(ObstacleDef {
            terrain: TerrainRule {
                river: true,
                river_shore: true,
                ..TerrainRule::default()
            },
            ..obstacle(circle(1.4), ScaleRange { min: 0.9, max: 1.1 }, 80.0)
        }),
    );
    defs.insert(
        "barrel_01",
        Obstacle(obstacle(circle(1.75), ScaleRange::ONE, 150.0)),
    );
    defs.insert(
        "crate_01",
        Obstacle(ObstacleDef {
            loot: Some("tier_crate"),
            ..obstacle(rect(2.25, 2.25), ScaleRange::ONE, 75.0)
        }),
    );
    defs.insert(
        "airdrop_crate_01",
        Obstacle(ObstacleDef {
            loot: Some("tier_airdrop"),
            ..obstacle(rect(2.5, 2.5), ScaleRange::ONE, 200.0)
        }),
    );
    defs.insert(
        "driftwood_01",
        Obstacle(ObstacleDef {
            terrain: TerrainRule {
                beach: true,
                ..TerrainRule::default()
            },
            ..obstacle(rect(3.0, 0.8), ScaleRange { min: 0.9, max: 1.1 }, 100.0)
        }),
    );
    defs.insert(
        "wall_01",
        Obstacle(ObstacleDef {
            destructible: false,
            ..obstacle(rect(0.5, 4.0), ScaleRange::ONE, 1.0)
        }),
    );
    defs.insert(
        "table_01",
        Obstacle(obstacle(rect(1.5, 1.5), ScaleRange::ONE, 100.0)),
    );

    // ------------------------------------------------------------------
    // Buildings
    // ------------------------------------------------------------------

    defs.insert(
        "house_red_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(11.0, 9.0)],
            children: vec![
                child("crate_01", 5.0, 3.0),
                child("table_01", -5.0, -3.0),
                child("barrel_01", -6.0, 4.5),
                child("wall_01", 10.5, -4.0),
                child("loot_tier_1", 0.0, 0.0),
            ],
            floor_surfaces: vec![floor("house", 10.5, 8.5)],
            zoom_regions: vec![aabb(-10.5, -8.5, 10.5, 8.5)],
            occupied_emitters: true,
            map_display: true,
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "barn_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(16.0, 12.0)],
            children: vec![
                child("crate_01", 10.0, 6.0),
                child("crate_01", -10.0, -6.0),
                child("barrel_01", 11.0, -7.0),
                child("loot_tier_1", 0.0, 0.0),
            ],
            floor_surfaces: vec![floor("barn", 15.5, 11.5)],
            zoom_regions: vec![aabb(-15.5, -11.5, 15.5, 11.5)],
            ground_patches: vec![GroundPatch {
                bound: aabb(-18.0, -14.0, 18.0, 14.0),
                color: 0x6b5a3e,
            }],
            occupied_emitters: true,
            map_display: true,
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "greenhouse_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(14.0, 8.0)],
            children: vec![child("crate_01", 8.0, 0.0), child("crate_01", -8.0, 0.0)],
            floor_surfaces: vec![floor("tile", 13.5, 7.5)],
            zoom_regions: vec![aabb(-13.5, -7.5, 13.5, 7.5)],
            map_display: true,
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "warehouse_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(20.0, 10.0)],
            children: vec![
                child("crate_01", 14.0, 5.0),
                child("crate_01", 14.0, -5.0),
                child("crate_01", -14.0, 5.0),
                child("crate_01", -14.0, -5.0),
                child("loot_tier_1", 0.0, 0.0),
            ],
            floor_surfaces: vec![floor("warehouse", 19.5, 9.5)],
            zoom_regions: vec![aabb(-19.5, -9.5, 19.5, 9.5)],
            map_display: true,
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "hut_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(6.0, 6.0)],
            children: vec![child("barrel_01", 2.5, 2.5)],
            floor_surfaces: vec![floor("hut", 6.0, 6.0)],
            zoom_regions: vec![aabb(-5.5, -5.5, 5.5, 5.5)],
            map_display: true,
            terrain: TerrainRule {
                water_edge: Some(WaterEdge {
                    dir: Vec2::new(-1.0, 0.0),
                    dist_min: -8.0,
                    dist_max: -4.0,
                }),
                ..TerrainRule::default()
            },
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "cabin_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(7.0, 7.0)],
            children: vec![child("table_01", 0.0, 2.0), child("loot_tier_1", 0.0, -2.0)],
            floor_surfaces: vec![floor("house", 7.0, 7.0)],
            zoom_regions: vec![aabb(-6.5, -6.5, 6.5, 6.5)],
            occupied_emitters: true,
            map_display: true,
            terrain: TerrainRule {
                river_shore: true,
                nearby_river: Some(NearbyRiver { facing_ori: 1 }),
                ..TerrainRule::default()
            },
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "dock_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(1.5, 3.0)],
            floor_surfaces: vec![floor("bridge", 1.5, 3.0)],
            terrain: TerrainRule {
                river: true,
                ..TerrainRule::default()
            },
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "lake_island_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(4.0, 4.0)],
            children: vec![child("crate_01", 0.0, 0.0)],
            floor_surfaces: vec![floor("sand", 6.0, 6.0)],
            map_display: true,
            terrain: TerrainRule {
                lake_center: true,
                ..TerrainRule::default()
            },
            ..BuildingDef::default()
        }),
    );
    for (name, team_id) in [("outpost_red_01", 1u8), ("outpost_blue_01", 2u8)] {
        defs.insert(
            name,
            Building(BuildingDef {
                map_obstacle_bounds: vec![rect(12.0, 10.0)],
                children: vec![
                    child("crate_01", 7.0, 5.0),
                    child("barrel_01", -7.0, -5.0),
                    child("loot_tier_1", 0.0, 0.0),
                ],
                floor_surfaces: vec![floor("house", 11.5, 9.5)],
                zoom_regions: vec![aabb(-11.5, -9.5, 11.5, 9.5)],
                team_id: Some(team_id),
                map_display: true,
                ..BuildingDef::default()
            }),
        );
    }

    // Faction river crossing; ori is forced from the split axis
    defs.insert(
        "river_town_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(48.0, 12.0)],
            children: vec![
                child("crate_01", -38.0, 8.0),
                child("crate_01", 38.0, -8.0),
                child("barrel_01", -38.0, -8.0),
                child("barrel_01", 38.0, 8.0),
            ],
            floor_surfaces: vec![floor("bridge", 40.0, 6.0)],
            bridge_land_bounds: vec![aabb(-46.0, -4.0, -42.0, 4.0), aabb(42.0, -4.0, 46.0, 4.0)],
            bridge_water_bounds: vec![aabb(-2.0, -4.0, 2.0, 4.0)],
            map_display: true,
            terrain: TerrainRule {
                bridge: true,
                ..TerrainRule::default()
            },
            ..BuildingDef::default()
        }),
    );

    // Bunker: a small hatch above ground, a chamber on the bunker layer
    defs.insert(
        "bunker_hatch_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(3.0, 3.0)],
            floor_surfaces: vec![floor("container", 3.0, 3.0)],
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "bunker_chamber_01",
        Building(BuildingDef {
            map_obstacle_bounds: vec![rect(10.0, 8.0)],
            children: vec![child("crate_01", 5.0, 0.0), child("loot_tier_1", -4.0, 0.0)],
            floor_surfaces: vec![floor("bunker", 10.0, 8.0)],
            ..BuildingDef::default()
        }),
    );
    defs.insert(
        "bunker_structure_01",
        Structure(StructureDef {
            map_obstacle_bounds: vec![rect(4.0, 4.0)],
            layers: vec![
                StructureLayer {
                    type_name: "bunker_hatch_01",
                    pos: Vec2::ZERO,
                    ori: 0,
                },
                StructureLayer {
                    type_name: "bunker_chamber_01",
                    pos: Vec2::new(0.0, -6.0),
                    ori: 0,
                },
            ],
            terrain: TerrainRule {
                grass: true,
                ..TerrainRule::default()
            },
            ..StructureDef::default()
        }),
    );

    // ------------------------------------------------------------------
    // Bridges
    // ------------------------------------------------------------------

    for (structure_name, deck_name, len, land, water) in [
        ("bridge_md_structure", "bridge_md_01", 36.0, (15.0, 18.0), 2.0),
        ("bridge_lg_structure", "bridge_lg_01", 64.0, (28.0, 32.0), 4.0),
        ("bridge_xlg_structure", "bridge_xlg_01", 90.0, (41.0, 45.0), 8.0),
    ] {
        let (mut structure, deck) = bridge(len, land, water);
        structure.layers.push(StructureLayer {
            type_name: deck_name,
            pos: Vec2::ZERO,
            ori: 0,
        });
        defs.insert(structure_name, Structure(structure));
        defs.insert(deck_name, Building(deck));
    }

    // ------------------------------------------------------------------
    // Loot spawners and decals
    // ------------------------------------------------------------------

    defs.insert("loot_tier_1", LootSpawner { tier: "tier_1" });
    defs.insert("decal_blood_01", Decal(DecalDef { collision: None }));

    defs
}

/// Items produced by a loot tier, as `(item, count)`
pub fn loot_table(tier: &str) -> &'static [(&'static str, u16)] {
    match tier {
        "tier_1" => &[("bandage", 2), ("9mm", 30)],
        "tier_crate" => &[("9mm", 15)],
        "tier_airdrop" => &[("helmet02", 1), ("762mm", 60), ("healthkit", 1)],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_reference_known_types() {
        for (name, def) in catalog() {
            match def {
                MapObjectDef::Building(b) => {
                    for c in &b.children {
                        assert!(object_def(c.type_name).is_some(), "{name} -> {}", c.type_name);
                    }
                }
                MapObjectDef::Structure(s) => {
                    for l in &s.layers {
                        assert!(object_def(l.type_name).is_some(), "{name} -> {}", l.type_name);
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_bridge_water_bounds_sit_between_land_bounds() {
        for name in ["bridge_md_structure", "bridge_lg_structure", "bridge_xlg_structure"] {
            let def = object_def(name).unwrap();
            assert!(def.is_bridge());
            let water = def.bridge_water_bounds()[0];
            for land in def.bridge_land_bounds() {
                assert!(!land.intersects(&water));
            }
        }
    }

    #[test]
    fn test_loot_spawner_tiers_have_tables() {
        assert!(!loot_table("tier_1").is_empty());
        assert!(loot_table("unknown").is_empty());
    }
}
