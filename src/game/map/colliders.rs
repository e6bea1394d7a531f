//! Per-type placement colliders
//!
//! A type's colliders are a pure function of its definition, so they are
//! computed once and shared by every match through a read-through cache.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::defs::objects::MapObjectDef;
use crate::defs::object_def_entry;
use crate::geom::{Aabb, Collider, Vec2};

/// Loot spawners reserve a small circle so nothing is placed on their items
const LOOT_SPAWNER_RAD: f32 = 3.0;
/// Buildings and structures keep extra clearance while being placed
const BUILDING_PLACEMENT_SCALE: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct GroundBunkerColliders {
    pub ground: Vec<Collider>,
    pub bunker: Vec<Collider>,
    pub grid_bound: Aabb,
}

impl GroundBunkerColliders {
    fn empty() -> Self {
        Self {
            ground: Vec::new(),
            bunker: Vec::new(),
            grid_bound: Aabb::new(Vec2::ZERO, Vec2::new(1.0, 1.0)),
        }
    }

    /// Place in world space at the scale the object will be created with.
    /// Buildings and structures also carry a copy inflated around their
    /// origin so their surroundings stay clear.
    pub fn transform(&self, pos: Vec2, ori: u8, scale: f32, building_like: bool) -> GroundBunkerColliders {
        let mut placed = GroundBunkerColliders {
            ground: self.ground.iter().map(|c| c.transform(pos, ori, scale)).collect(),
            bunker: self.bunker.iter().map(|c| c.transform(pos, ori, scale)).collect(),
            grid_bound: self.grid_bound.transform(pos, ori, scale),
        };
        if building_like {
            let inflated = BUILDING_PLACEMENT_SCALE * scale;
            placed.ground.extend(self.ground.iter().map(|c| c.transform(pos, ori, inflated)));
            placed.bunker.extend(self.bunker.iter().map(|c| c.transform(pos, ori, inflated)));
            let outer = self.grid_bound.transform(pos, ori, inflated);
            placed.grid_bound = placed.grid_bound.union(&outer);
        }
        placed
    }

    /// Test the set matching `layer` against another object's obstacle bounds
    pub fn collides_with(&self, others: &[Collider], layer: u8) -> bool {
        let own = if layer == 0 { &self.ground } else { &self.bunker };
        own.iter().any(|a| others.iter().any(|b| a.intersects(b)))
    }

    /// Bounds of the above-ground footprint
    pub fn bounding_aabb(&self) -> Aabb {
        let ground: Vec<Aabb> = self.ground.iter().map(Collider::bounds).collect();
        Aabb::bounding(&ground).unwrap_or(self.grid_bound)
    }
}

type Cache = RwLock<HashMap<&'static str, Arc<GroundBunkerColliders>>>;

static CACHE: OnceLock<Cache> = OnceLock::new();

fn cache() -> &'static Cache {
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Colliders of `type_name` in its local frame. Unknown types get an empty set.
pub fn colliders_for(type_name: &str) -> Arc<GroundBunkerColliders> {
    if let Some(hit) = cache().read().get(type_name) {
        return hit.clone();
    }

    let Some((name, def)) = object_def_entry(type_name) else {
        return Arc::new(GroundBunkerColliders::empty());
    };

    // Computing recurses into child types, so no lock is held here
    let computed = Arc::new(compute(def));
    cache().write().entry(name).or_insert(computed).clone()
}

fn push_child(target: &mut Vec<Collider>, child: &[Collider], pos: Vec2, ori: u8, scale: f32) {
    target.extend(child.iter().map(|c| c.transform(pos, ori, scale)));
}

fn compute(def: &MapObjectDef) -> GroundBunkerColliders {
    let mut colls = GroundBunkerColliders::empty();

    match def {
        MapObjectDef::Obstacle(obstacle) => colls.ground.push(obstacle.collision),
        MapObjectDef::Structure(structure) => {
            colls.ground.extend(structure.map_obstacle_bounds.iter().copied());

            for (i, layer) in structure.layers.iter().enumerate() {
                let child = colliders_for(layer.type_name);
                let target = if i == 0 { &mut colls.ground } else { &mut colls.bunker };
                push_child(target, &child.ground, layer.pos, layer.ori, 1.0);
                push_child(target, &child.bunker, layer.pos, layer.ori, 1.0);
            }

            colls.ground.extend(structure.bridge_land_bounds.iter().copied().map(Collider::Aabb));
            colls.ground.extend(structure.bridge_water_bounds.iter().copied().map(Collider::Aabb));
        }
        MapObjectDef::Building(building) => {
            colls.ground.extend(building.map_obstacle_bounds.iter().copied());

            for object in &building.children {
                let child = colliders_for(object.type_name);
                push_child(&mut colls.ground, &child.ground, object.pos, object.ori, object.scale);
                push_child(&mut colls.bunker, &child.bunker, object.pos, object.ori, object.scale);
            }

            colls.ground.extend(building.ground_patches.iter().map(|p| Collider::Aabb(p.bound)));
            for surface in &building.floor_surfaces {
                colls.ground.extend(surface.collision.iter().copied());
            }
            colls.ground.extend(building.zoom_regions.iter().copied().map(Collider::Aabb));
            colls.ground.extend(building.bridge_land_bounds.iter().copied().map(Collider::Aabb));
            colls.ground.extend(building.bridge_water_bounds.iter().copied().map(Collider::Aabb));
        }
        MapObjectDef::LootSpawner { .. } => {
            colls.ground.push(Collider::circle(Vec2::ZERO, LOOT_SPAWNER_RAD));
        }
        MapObjectDef::Decal(_) => {}
    }

    let aabbs: Vec<Aabb> = colls
        .bunker
        .iter()
        .chain(colls.ground.iter())
        .map(Collider::bounds)
        .collect();
    if let Some(bound) = Aabb::bounding(&aabbs) {
        colls.grid_bound = bound;
    }

    colls
}

/// Region two bridges may not share
pub fn bridge_overlap_bounds(def: &MapObjectDef, pos: Vec2, ori: u8) -> Option<Aabb> {
    let local: Vec<Aabb> = def
        .bridge_land_bounds()
        .iter()
        .chain(def.bridge_water_bounds())
        .copied()
        .collect();
    Aabb::bounding(&local).map(|b| b.transform(pos, ori, 1.0))
}
