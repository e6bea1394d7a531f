//! Simulated entities
//!
//! Every object a match owns is one variant of [`Entity`]. The world keeps
//! them by id; the spatial grid only stores ids and bounds.

use crate::geom::{Aabb, Collider, Vec2};

use super::player::{Player, PLAYER_RADIUS};

pub type EntityId = u16;

/// Ground layer
pub const LAYER_GROUND: u8 = 0;
/// Bunker layer
pub const LAYER_BUNKER: u8 = 1;
/// Set while standing on stairs between the two layers
pub const LAYER_STAIRS: u8 = 0x2;

/// Objects on stairs see both layers
pub fn same_layer(a: u8, b: u8) -> bool {
    (a & 1) == (b & 1) || ((a & LAYER_STAIRS) != 0 && (b & LAYER_STAIRS) != 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntityKind {
    Player = 1,
    Obstacle = 2,
    Loot = 3,
    Building = 4,
    Structure = 5,
    Decal = 6,
    Projectile = 7,
    Airdrop = 8,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Player,
        EntityKind::Obstacle,
        EntityKind::Loot,
        EntityKind::Building,
        EntityKind::Structure,
        EntityKind::Decal,
        EntityKind::Projectile,
        EntityKind::Airdrop,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }

    /// Kinds that block placement and movement
    pub fn is_collidable(self) -> bool {
        matches!(
            self,
            EntityKind::Obstacle | EntityKind::Building | EntityKind::Structure
        )
    }
}

#[derive(Debug, Clone)]
pub struct Obstacle {
    pub id: EntityId,
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
    pub scale: f32,
    pub layer: u8,
    /// World-space collision shape
    pub collider: Collider,
    pub health: f32,
    pub max_health: f32,
    pub destructible: bool,
    pub dead: bool,
    pub parent: Option<EntityId>,
    pub loot: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct Surface {
    pub kind: &'static str,
    pub colliders: Vec<Collider>,
}

#[derive(Debug, Clone)]
pub struct Building {
    pub id: EntityId,
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
    pub layer: u8,
    pub map_obstacle_bounds: Vec<Collider>,
    pub surfaces: Vec<Surface>,
    pub zoom_regions: Vec<Aabb>,
    /// Region players are searched in for the occupied state
    pub emitter_bounds: Aabb,
    pub has_emitters: bool,
    pub occupied: bool,
    pub children: Vec<EntityId>,
    pub parent: Option<EntityId>,
}

#[derive(Debug, Clone)]
pub struct Structure {
    pub id: EntityId,
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
    pub layer: u8,
    pub map_obstacle_bounds: Vec<Collider>,
    /// One building per structure layer, in layer order
    pub layer_ids: Vec<EntityId>,
}

#[derive(Debug, Clone)]
pub struct Loot {
    pub id: EntityId,
    pub item: &'static str,
    pub count: u16,
    pub pos: Vec2,
    pub layer: u8,
}

#[derive(Debug, Clone)]
pub struct Decal {
    pub id: EntityId,
    pub type_name: &'static str,
    pub pos: Vec2,
    pub ori: u8,
    pub scale: f32,
    pub layer: u8,
    pub collider: Option<Collider>,
}

#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: EntityId,
    pub owner: EntityId,
    pub owner_group: u8,
    pub owner_team: u8,
    pub pos: Vec2,
    pub dir: Vec2,
    pub speed: f32,
    pub damage: f32,
    /// Distance left before the projectile expires
    pub range_left: f32,
    pub layer: u8,
}

#[derive(Debug, Clone)]
pub struct Airdrop {
    pub id: EntityId,
    pub pos: Vec2,
    /// Seconds until the crate lands
    pub fall_time: f32,
    pub landed: bool,
}

pub const LOOT_RADIUS: f32 = 1.0;
pub const PROJECTILE_RADIUS: f32 = 0.2;
pub const AIRDROP_RADIUS: f32 = 2.5;

#[derive(Debug, Clone)]
pub enum Entity {
    Player(Box<Player>),
    Obstacle(Obstacle),
    Loot(Loot),
    Building(Building),
    Structure(Structure),
    Decal(Decal),
    Projectile(Projectile),
    Airdrop(Airdrop),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Player(p) => p.id,
            Entity::Obstacle(o) => o.id,
            Entity::Loot(l) => l.id,
            Entity::Building(b) => b.id,
            Entity::Structure(s) => s.id,
            Entity::Decal(d) => d.id,
            Entity::Projectile(p) => p.id,
            Entity::Airdrop(a) => a.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Player(_) => EntityKind::Player,
            Entity::Obstacle(_) => EntityKind::Obstacle,
            Entity::Loot(_) => EntityKind::Loot,
            Entity::Building(_) => EntityKind::Building,
            Entity::Structure(_) => EntityKind::Structure,
            Entity::Decal(_) => EntityKind::Decal,
            Entity::Projectile(_) => EntityKind::Projectile,
            Entity::Airdrop(_) => EntityKind::Airdrop,
        }
    }

    pub fn pos(&self) -> Vec2 {
        match self {
            Entity::Player(p) => p.pos,
            Entity::Obstacle(o) => o.pos,
            Entity::Loot(l) => l.pos,
            Entity::Building(b) => b.pos,
            Entity::Structure(s) => s.pos,
            Entity::Decal(d) => d.pos,
            Entity::Projectile(p) => p.pos,
            Entity::Airdrop(a) => a.pos,
        }
    }

    pub fn layer(&self) -> u8 {
        match self {
            Entity::Player(p) => p.layer,
            Entity::Obstacle(o) => o.layer,
            Entity::Loot(l) => l.layer,
            Entity::Building(b) => b.layer,
            Entity::Structure(s) => s.layer,
            Entity::Decal(d) => d.layer,
            Entity::Projectile(p) => p.layer,
            Entity::Airdrop(_) => LAYER_GROUND,
        }
    }

    /// Bounds stored in the spatial grid
    pub fn bounds(&self) -> Aabb {
        match self {
            Entity::Player(p) => Aabb::from_center(p.pos, PLAYER_RADIUS, PLAYER_RADIUS),
            Entity::Obstacle(o) => o.collider.bounds(),
            Entity::Loot(l) => Aabb::from_center(l.pos, LOOT_RADIUS, LOOT_RADIUS),
            Entity::Building(b) => {
                let shapes = b
                    .map_obstacle_bounds
                    .iter()
                    .map(Collider::bounds)
                    .chain(b.surfaces.iter().flat_map(|s| s.colliders.iter().map(Collider::bounds)))
                    .chain(b.zoom_regions.iter().copied())
                    .collect::<Vec<_>>();
                Aabb::bounding(&shapes).unwrap_or_else(|| Aabb::from_center(b.pos, 1.0, 1.0))
            }
            Entity::Structure(s) => {
                let shapes: Vec<Aabb> = s.map_obstacle_bounds.iter().map(Collider::bounds).collect();
                Aabb::bounding(&shapes).unwrap_or_else(|| Aabb::from_center(s.pos, 1.0, 1.0))
            }
            Entity::Decal(d) => d
                .collider
                .map(|c| c.bounds())
                .unwrap_or_else(|| Aabb::from_center(d.pos, d.scale, d.scale)),
            Entity::Projectile(p) => Aabb::from_center(p.pos, PROJECTILE_RADIUS, PROJECTILE_RADIUS),
            Entity::Airdrop(a) => Aabb::from_center(a.pos, AIRDROP_RADIUS, AIRDROP_RADIUS),
        }
    }

    /// Shapes other objects may not be placed on; empty for non-collidable kinds
    pub fn map_obstacle_bounds(&self) -> &[Collider] {
        match self {
            Entity::Obstacle(o) => std::slice::from_ref(&o.collider),
            Entity::Building(b) => &b.map_obstacle_bounds,
            Entity::Structure(s) => &s.map_obstacle_bounds,
            _ => &[],
        }
    }

    pub fn as_player(&self) -> Option<&Player> {
        match self {
            Entity::Player(p) => Some(&**p),
            _ => None,
        }
    }

    pub fn as_player_mut(&mut self) -> Option<&mut Player> {
        match self {
            Entity::Player(p) => Some(&mut **p),
            _ => None,
        }
    }

    pub fn as_obstacle_mut(&mut self) -> Option<&mut Obstacle> {
        match self {
            Entity::Obstacle(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_building(&self) -> Option<&Building> {
        match self {
            Entity::Building(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_building_mut(&mut self) -> Option<&mut Building> {
        match self {
            Entity::Building(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&Structure> {
        match self {
            Entity::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decal(&self) -> Option<&Decal> {
        match self {
            Entity::Decal(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_projectile(&self) -> Option<&Projectile> {
        match self {
            Entity::Projectile(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_projectile_mut(&mut self) -> Option<&mut Projectile> {
        match self {
            Entity::Projectile(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_airdrop_mut(&mut self) -> Option<&mut Airdrop> {
        match self {
            Entity::Airdrop(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_layer() {
        assert!(same_layer(LAYER_GROUND, LAYER_GROUND));
        assert!(!same_layer(LAYER_GROUND, LAYER_BUNKER));
        assert!(same_layer(LAYER_STAIRS, LAYER_BUNKER | LAYER_STAIRS));
        assert!(same_layer(LAYER_BUNKER, LAYER_BUNKER | LAYER_STAIRS));
    }

    #[test]
    fn test_kind_indices_are_dense() {
        for (i, kind) in EntityKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
