//! Static game content consumed by the core: object catalog, map layouts, team modes

pub mod maps;
pub mod objects;

pub use maps::{map_def, GasStageDef, MapDef, SpawnCount};
pub use objects::{object_def, object_def_entry, MapObjectDef};

use serde::{Deserialize, Serialize};

/// Team size of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamMode {
    Solo,
    Duo,
    Trio,
    Squad,
}

impl TeamMode {
    pub fn group_size(self) -> u8 {
        match self {
            TeamMode::Solo => 1,
            TeamMode::Duo => 2,
            TeamMode::Trio => 3,
            TeamMode::Squad => 4,
        }
    }

    /// Maps above duo size use the large map scale
    pub fn is_large(self) -> bool {
        self.group_size() > TeamMode::Duo.group_size()
    }
}
