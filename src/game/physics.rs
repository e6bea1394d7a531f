//! Player movement and collision response

use crate::geom::{Aabb, Collider, Vec2};

use super::entity::{same_layer, Entity};
use super::map::GameMap;
use super::player::{Player, PLAYER_RADIUS, PLAYER_SPEED, WATER_SPEED_FACTOR};
use super::world::World;

/// Push-out passes per move; two settle a player wedged between obstacles
const COLLISION_PASSES: usize = 2;

/// Physics system for player movement
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Position `player` ends up at after moving for `dt` seconds
    pub fn move_player(world: &World, map: &GameMap, player: &Player, dt: f32) -> Vec2 {
        let dir = player.input.move_dir();
        if dir == Vec2::ZERO {
            return player.pos;
        }

        let mut speed = PLAYER_SPEED;
        if map.is_on_water(world, player.pos, player.layer) {
            speed *= WATER_SPEED_FACTOR;
        }

        let moved = player.pos + dir * (speed * dt);
        let resolved = Self::resolve_collisions(world, moved, PLAYER_RADIUS, player.layer);
        map.clamp_to_bounds(resolved, PLAYER_RADIUS)
    }

    /// Push a circle out of every live obstacle it overlaps on its layer
    pub fn resolve_collisions(world: &World, pos: Vec2, rad: f32, layer: u8) -> Vec2 {
        let mut pos = pos;
        for _ in 0..COLLISION_PASSES {
            let area = Aabb::from_center(pos, rad, rad);
            let pushes: Vec<Vec2> = world
                .query(&area)
                .filter_map(|e| match e {
                    Entity::Obstacle(o) if !o.dead && same_layer(o.layer, layer) => {
                        Self::penetration(&o.collider, pos, rad)
                    }
                    _ => None,
                })
                .collect();

            if pushes.is_empty() {
                break;
            }
            for push in pushes {
                pos += push;
            }
        }
        pos
    }

    /// Smallest offset that moves a circle at `pos` out of `collider`
    pub fn penetration(collider: &Collider, pos: Vec2, rad: f32) -> Option<Vec2> {
        match collider {
            Collider::Circle(c) => {
                let offset = pos - c.pos;
                let overlap = rad + c.rad - offset.length();
                (overlap > 0.0).then(|| offset.normalize_or(Vec2::new(1.0, 0.0)) * overlap)
            }
            Collider::Aabb(a) => {
                let closest = pos.clamp(a.min, a.max);
                let offset = pos - closest;
                let dist_sq = offset.length_sq();

                if dist_sq > 0.0 {
                    let dist = dist_sq.sqrt();
                    return (dist < rad).then(|| offset * ((rad - dist) / dist));
                }

                // Center inside the box: leave through the nearest side
                let exits = [
                    (pos.x - a.min.x, Vec2::new(-1.0, 0.0)),
                    (a.max.x - pos.x, Vec2::new(1.0, 0.0)),
                    (pos.y - a.min.y, Vec2::new(0.0, -1.0)),
                    (a.max.y - pos.y, Vec2::new(0.0, 1.0)),
                ];
                exits
                    .into_iter()
                    .min_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(depth, dir)| dir * (depth + rad))
            }
        }
    }

    /// True when the circle at `pos` overlaps any live obstacle on `layer`
    pub fn collides(world: &World, pos: Vec2, rad: f32, layer: u8) -> bool {
        let area = Aabb::from_center(pos, rad, rad);
        world.query(&area).any(|e| match e {
            Entity::Obstacle(o) => !o.dead && same_layer(o.layer, layer) && o.collider.intersects_circle(pos, rad),
            _ => false,
        })
    }
}
