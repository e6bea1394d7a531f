//! Map definitions: dimensions, terrain profile, spawn tables and gas stages

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::geom::Vec2;

#[derive(Debug, Clone)]
pub struct MapDimensions {
    pub base_width: f32,
    pub base_height: f32,
    pub scale_small: f32,
    pub scale_large: f32,
    pub extension: f32,
    pub shore_inset: f32,
    pub grass_inset: f32,
}

/// One weighted choice of river half-widths for a match
#[derive(Debug, Clone)]
pub struct RiverWeight {
    pub weight: f32,
    pub widths: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct LakeDef {
    pub inner_rad: f32,
    pub outer_rad: f32,
    /// Normalized map position
    pub spawn_pos: Vec2,
    pub spawn_rad: f32,
}

/// Circle rivers must not grow through; position is normalized
#[derive(Debug, Clone)]
pub struct RiverMask {
    pub pos: Vec2,
    pub rad: f32,
}

#[derive(Debug, Clone, Default)]
pub struct RiverSettings {
    pub weights: Vec<RiverWeight>,
    pub lakes: Vec<LakeDef>,
    pub masks: Vec<RiverMask>,
}

#[derive(Debug, Clone)]
pub struct PlaceDef {
    pub name: &'static str,
    /// Normalized position with y pointing down
    pub pos: Vec2,
}

/// Bridge type for each river size class
#[derive(Debug, Clone, Default)]
pub struct BridgeTypes {
    pub medium: Option<&'static str>,
    pub large: Option<&'static str>,
    pub xlarge: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub enum SpawnCount {
    Fixed(u32),
    /// Count depends on the map scale
    Scaled { small: u32, large: u32 },
    /// Spawn one with the given probability
    Odds(f32),
}

#[derive(Debug, Clone)]
pub struct RandomSpawns {
    pub spawns: Vec<&'static str>,
    pub choose: usize,
}

#[derive(Debug, Clone)]
pub struct LocationSpawn {
    pub type_name: &'static str,
    /// Normalized position
    pub pos: Vec2,
    pub rad: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasStageMode {
    Inactive,
    Waiting,
    Moving,
}

#[derive(Debug, Clone, Copy)]
pub struct GasStageDef {
    pub mode: GasStageMode,
    /// Seconds
    pub duration: f32,
    /// Target radius as a fraction of the map width
    pub rad: f32,
    /// Damage per second outside the safe zone
    pub damage: f32,
    /// Drop an airdrop when this stage begins
    pub airdrop: bool,
}

#[derive(Debug, Clone)]
pub struct GameModeDef {
    pub max_players: usize,
    pub faction_mode: bool,
    /// Joins are refused once the gas reaches this stage
    pub join_cutoff_stage: usize,
}

#[derive(Debug, Clone)]
pub struct MapDef {
    pub name: &'static str,
    pub dimensions: MapDimensions,
    pub rivers: RiverSettings,
    pub places: Vec<PlaceDef>,
    pub bridge_types: BridgeTypes,
    pub river_cabins: Vec<(&'static str, u32)>,
    pub fixed_spawns: Vec<(&'static str, SpawnCount)>,
    pub random_spawns: Vec<RandomSpawns>,
    pub density_spawns: Vec<(&'static str, f32)>,
    pub location_spawns: Vec<LocationSpawn>,
    /// Types that try to generate near a named place first
    pub place_spawns: Vec<&'static str>,
    pub spawn_replacements: Vec<(&'static str, &'static str)>,
    pub important_spawns: Vec<&'static str>,
    pub game_mode: GameModeDef,
    pub gas: Vec<GasStageDef>,
}

impl MapDef {
    pub fn replacement_for(&self, type_name: &'static str) -> &'static str {
        self.spawn_replacements
            .iter()
            .find(|(from, _)| *from == type_name)
            .map(|(_, to)| *to)
            .unwrap_or(type_name)
    }
}

static MAPS: OnceLock<HashMap<&'static str, MapDef>> = OnceLock::new();

pub fn map_def(name: &str) -> Option<&'static MapDef> {
    MAPS.get_or_init(build_maps).get(name)
}

fn gas_stage(mode: GasStageMode, duration: f32, rad: f32, damage: f32) -> GasStageDef {
    GasStageDef {
        mode,
        duration,
        rad,
        damage,
        airdrop: false,
    }
}

fn standard_gas() -> Vec<GasStageDef> {
    use GasStageMode::*;

    let mut stages = vec![
        gas_stage(Inactive, 0.0, 0.7625, 0.0),
        gas_stage(Waiting, 80.0, 0.55, 1.4),
        gas_stage(Moving, 30.0, 0.55, 1.4),
        gas_stage(Waiting, 65.0, 0.3, 2.2),
        gas_stage(Moving, 25.0, 0.3, 2.2),
        gas_stage(Waiting, 50.0, 0.2, 3.5),
        gas_stage(Moving, 20.0, 0.2, 3.5),
        gas_stage(Waiting, 40.0, 0.09, 7.5),
        gas_stage(Moving, 15.0, 0.09, 7.5),
        gas_stage(Waiting, 30.0, 0.0, 10.0),
        gas_stage(Moving, 20.0, 0.0, 10.0),
    ];
    stages[3].airdrop = true;
    stages[7].airdrop = true;
    stages
}

fn main_def() -> MapDef {
    MapDef {
        name: "main",
        dimensions: MapDimensions {
            base_width: 512.0,
            base_height: 512.0,
            scale_small: 1.1875,
            scale_large: 1.28125,
            extension: 112.0,
            shore_inset: 48.0,
            grass_inset: 18.0,
        },
        rivers: RiverSettings {
            weights: vec![
                RiverWeight { weight: 0.1, widths: vec![4.0] },
                RiverWeight { weight: 0.15, widths: vec![8.0] },
                RiverWeight { weight: 0.25, widths: vec![8.0, 4.0] },
                RiverWeight { weight: 0.21, widths: vec![16.0] },
                RiverWeight { weight: 0.09, widths: vec![16.0, 8.0] },
                RiverWeight { weight: 0.2, widths: vec![16.0, 8.0, 4.0] },
            ],
            lakes: Vec::new(),
            masks: Vec::new(),
        },
        places: vec![
            PlaceDef { name: "Riverside", pos: Vec2::new(0.25, 0.2) },
            PlaceDef { name: "Pineapple", pos: Vec2::new(0.75, 0.25) },
            PlaceDef { name: "Todville", pos: Vec2::new(0.3, 0.75) },
            PlaceDef { name: "Lakeside", pos: Vec2::new(0.7, 0.7) },
        ],
        bridge_types: BridgeTypes {
            medium: Some("bridge_md_structure"),
            large: Some("bridge_lg_structure"),
            xlarge: Some("bridge_xlg_structure"),
        },
        river_cabins: vec![("cabin_01", 1)],
        fixed_spawns: vec![
            ("warehouse_01", SpawnCount::Fixed(2)),
            ("house_red_01", SpawnCount::Scaled { small: 3, large: 4 }),
            ("barn_01", SpawnCount::Scaled { small: 1, large: 2 }),
            ("hut_01", SpawnCount::Fixed(2)),
            ("bunker_structure_01", SpawnCount::Odds(0.8)),
            ("driftwood_01", SpawnCount::Fixed(8)),
            ("loot_tier_1", SpawnCount::Scaled { small: 20, large: 26 }),
        ],
        random_spawns: vec![RandomSpawns {
            spawns: vec!["greenhouse_01", "barn_01"],
            choose: 1,
        }],
        density_spawns: vec![
            ("tree_01", 90.0),
            ("stone_01", 50.0),
            ("bush_01", 40.0),
            ("barrel_01", 20.0),
            ("crate_01", 30.0),
        ],
        location_spawns: Vec::new(),
        place_spawns: vec!["warehouse_01"],
        spawn_replacements: Vec::new(),
        important_spawns: vec!["warehouse_01"],
        game_mode: GameModeDef {
            max_players: 80,
            faction_mode: false,
            join_cutoff_stage: 3,
        },
        gas: standard_gas(),
    }
}

fn main_spring_def() -> MapDef {
    let mut def = main_def();
    def.name = "main_spring";
    def.rivers.lakes.push(LakeDef {
        inner_rad: 30.0,
        outer_rad: 64.0,
        spawn_pos: Vec2::new(0.5, 0.5),
        spawn_rad: 80.0,
    });
    def.rivers.masks.push(RiverMask {
        pos: Vec2::new(0.5, 0.5),
        rad: 90.0,
    });
    def.fixed_spawns.push(("lake_island_01", SpawnCount::Fixed(1)));
    def.location_spawns.push(LocationSpawn {
        type_name: "greenhouse_01",
        pos: Vec2::new(0.5, 0.2),
        rad: 60.0,
    });
    def.spawn_replacements = vec![("tree_01", "tree_07sp")];
    def
}

fn faction_def() -> MapDef {
    let mut def = main_def();
    def.name = "faction";
    def.dimensions.scale_small = def.dimensions.scale_large;
    def.rivers.weights = vec![RiverWeight {
        weight: 1.0,
        widths: vec![24.0, 8.0],
    }];
    def.bridge_types.medium = None;
    def.fixed_spawns = vec![
        ("river_town_01", SpawnCount::Fixed(1)),
        ("outpost_red_01", SpawnCount::Fixed(2)),
        ("outpost_blue_01", SpawnCount::Fixed(2)),
        ("house_red_01", SpawnCount::Fixed(4)),
        ("barn_01", SpawnCount::Fixed(2)),
        ("greenhouse_01", SpawnCount::Fixed(2)),
        ("bunker_structure_01", SpawnCount::Fixed(1)),
        ("loot_tier_1", SpawnCount::Fixed(24)),
    ];
    def.random_spawns = Vec::new();
    def.river_cabins = Vec::new();
    def.place_spawns = Vec::new();
    def.important_spawns = vec!["river_town_01"];
    def.game_mode = GameModeDef {
        max_players: 100,
        faction_mode: true,
        join_cutoff_stage: 3,
    };
    def
}

fn build_maps() -> HashMap<&'static str, MapDef> {
    [main_def(), main_spring_def(), faction_def()]
        .into_iter()
        .map(|def| (def.name, def))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::object_def;

    #[test]
    fn test_all_referenced_types_exist() {
        for name in ["main", "main_spring", "faction"] {
            let def = map_def(name).unwrap();
            let mut names: Vec<&str> = def.fixed_spawns.iter().map(|(t, _)| *t).collect();
            names.extend(def.density_spawns.iter().map(|(t, _)| *t));
            names.extend(def.random_spawns.iter().flat_map(|r| r.spawns.iter().copied()));
            names.extend(def.river_cabins.iter().map(|(t, _)| *t));
            names.extend(def.spawn_replacements.iter().map(|(_, t)| *t));
            for t in names {
                assert!(object_def(t).is_some(), "{name}: unknown type {t}");
            }
        }
    }

    #[test]
    fn test_gas_starts_inactive() {
        let def = map_def("main").unwrap();
        assert_eq!(def.gas[0].mode, GasStageMode::Inactive);
        assert!(def.game_mode.join_cutoff_stage < def.gas.len());
    }

    #[test]
    fn test_unknown_map() {
        assert!(map_def("atlantis").is_none());
    }
}
