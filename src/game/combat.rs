//! Combat system - weapons, projectiles, hit detection

use crate::geom::poly::distance_to_segment;
use crate::geom::{Aabb, Vec2};

use super::entity::{same_layer, Entity, EntityId, EntityKind, Projectile, PROJECTILE_RADIUS};
use super::player::{Player, PLAYER_RADIUS};
use super::world::{IdsExhausted, World};

/// Weapon every player carries
#[derive(Debug, Clone, Copy)]
pub struct WeaponStats {
    /// Damage per hit
    pub damage: f32,
    /// Units per second
    pub projectile_speed: f32,
    /// Seconds between shots
    pub cooldown: f32,
    /// Distance a projectile travels before it expires
    pub range: f32,
}

impl Default for WeaponStats {
    fn default() -> Self {
        Self {
            damage: 12.0,
            projectile_speed: 85.0,
            cooldown: 0.1,
            range: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    Player(EntityId),
    Obstacle(EntityId),
}

/// Hit result from combat resolution
#[derive(Debug, Clone)]
pub struct HitResult {
    pub projectile: EntityId,
    pub shooter: EntityId,
    pub target: HitTarget,
    pub damage: f32,
    pub pos: Vec2,
}

/// Outcome of advancing every projectile by one tick
#[derive(Debug, Default)]
pub struct ProjectileStep {
    pub hits: Vec<HitResult>,
    /// Ran out of range without hitting anything
    pub expired: Vec<EntityId>,
}

/// Combat system for managing weapons and damage
pub struct CombatSystem;

impl CombatSystem {
    /// Check if a player can fire (cooldown check)
    pub fn can_fire(weapon_cooldown: f32) -> bool {
        weapon_cooldown <= 0.0
    }

    pub fn update_cooldown(cooldown: f32, dt: f32) -> f32 {
        (cooldown - dt).max(0.0)
    }

    /// Apply damage to health, returns (new_health, is_dead)
    pub fn apply_damage(current_health: f32, damage: f32) -> (f32, bool) {
        let new_health = (current_health - damage).max(0.0);
        (new_health, new_health <= 0.0)
    }

    /// Gas damage for one tick
    pub fn gas_damage(damage_per_second: f32, dt: f32) -> f32 {
        damage_per_second * dt
    }

    /// Spawn a projectile just outside the shooter, heading along its aim
    pub fn fire(world: &mut World, shooter: &Player, stats: &WeaponStats) -> Result<EntityId, IdsExhausted> {
        let dir = shooter.input.aim.normalize_or(shooter.dir);
        let pos = shooter.pos + dir * (PLAYER_RADIUS + PROJECTILE_RADIUS);

        world.insert(|id| {
            Entity::Projectile(Projectile {
                id,
                owner: shooter.id,
                owner_group: shooter.group_id,
                owner_team: shooter.team_id,
                pos,
                dir,
                speed: stats.projectile_speed,
                damage: stats.damage,
                range_left: stats.range,
                layer: shooter.layer,
            })
        })
    }

    /// Move every projectile and report what it ran into. Projectiles that hit
    /// or expired are left in the world for the caller to remove.
    pub fn step_projectiles(world: &mut World, dt: f32) -> ProjectileStep {
        let mut step = ProjectileStep::default();
        let ids: Vec<EntityId> = world.ids_of(EntityKind::Projectile).collect();

        for id in ids {
            let Some(projectile) = world.get(id).and_then(Entity::as_projectile).cloned() else {
                continue;
            };

            let travel = (projectile.speed * dt).min(projectile.range_left);
            let from = projectile.pos;
            let to = from + projectile.dir * travel;

            if let Some((target, pos)) = Self::first_hit(world, &projectile, from, to) {
                step.hits.push(HitResult {
                    projectile: id,
                    shooter: projectile.owner,
                    target,
                    damage: projectile.damage,
                    pos,
                });
                continue;
            }

            let range_left = projectile.range_left - travel;
            if let Some(p) = world.get_mut(id).and_then(Entity::as_projectile_mut) {
                p.pos = to;
                p.range_left = range_left;
            }
            world.refresh(id);
            world.mark_part_dirty(id);

            if range_left <= 0.0 {
                step.expired.push(id);
            }
        }

        step
    }

    /// Nearest player or obstacle along the segment `from..to`
    fn first_hit(world: &World, projectile: &Projectile, from: Vec2, to: Vec2) -> Option<(HitTarget, Vec2)> {
        let reach = PLAYER_RADIUS + PROJECTILE_RADIUS;
        let area = Aabb::new(from.min(to), from.max(to)).expand(reach);

        world
            .query(&area)
            .filter_map(|e| match e {
                Entity::Player(p)
                    if p.is_alive()
                        && p.id != projectile.owner
                        && !p.is_ally(projectile.owner_group, projectile.owner_team)
                        && same_layer(p.layer, projectile.layer)
                        && distance_to_segment(p.pos, from, to) <= reach =>
                {
                    Some((HitTarget::Player(p.id), p.pos))
                }
                Entity::Obstacle(o)
                    if !o.dead
                        && same_layer(o.layer, projectile.layer)
                        && o.collider.intersects_circle(to, PROJECTILE_RADIUS) =>
                {
                    Some((HitTarget::Obstacle(o.id), to))
                }
                _ => None,
            })
            .min_by(|a, b| a.1.distance_sq(from).total_cmp(&b.1.distance_sq(from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{Obstacle, LAYER_GROUND};
    use crate::geom::Collider;
    use uuid::Uuid;

    fn add_player(world: &mut World, group: u8, pos: Vec2) -> EntityId {
        world
            .insert(|id| Entity::Player(Box::new(Player::new(id, Uuid::new_v4(), "p".into(), group, 0, pos))))
            .unwrap()
    }

    fn shooter(world: &World, id: EntityId) -> Player {
        world.get(id).and_then(Entity::as_player).cloned().unwrap()
    }

    #[test]
    fn test_apply_damage() {
        assert_eq!(CombatSystem::apply_damage(100.0, 30.0), (70.0, false));
        assert_eq!(CombatSystem::apply_damage(10.0, 30.0), (0.0, true));
    }

    #[test]
    fn test_cooldown() {
        assert!(CombatSystem::can_fire(0.0));
        assert!(!CombatSystem::can_fire(0.05));
        assert_eq!(CombatSystem::update_cooldown(0.05, 0.1), 0.0);
    }

    #[test]
    fn test_projectile_hits_enemy() {
        let mut world = World::new(200.0, 200.0);
        let a = add_player(&mut world, 1, Vec2::new(50.0, 50.0));
        let b = add_player(&mut world, 2, Vec2::new(55.0, 50.0));

        let mut player = shooter(&world, a);
        player.input.aim = Vec2::new(1.0, 0.0);
        CombatSystem::fire(&mut world, &player, &WeaponStats::default()).unwrap();

        let mut hit = None;
        for _ in 0..20 {
            let step = CombatSystem::step_projectiles(&mut world, 0.01);
            if let Some(h) = step.hits.first() {
                hit = Some(h.target);
                break;
            }
        }
        assert_eq!(hit, Some(HitTarget::Player(b)));
    }

    #[test]
    fn test_projectile_ignores_allies() {
        let mut world = World::new(200.0, 200.0);
        let a = add_player(&mut world, 1, Vec2::new(50.0, 50.0));
        add_player(&mut world, 1, Vec2::new(53.0, 50.0));

        let mut player = shooter(&world, a);
        player.input.aim = Vec2::new(1.0, 0.0);
        CombatSystem::fire(&mut world, &player, &WeaponStats::default()).unwrap();

        for _ in 0..10 {
            assert!(CombatSystem::step_projectiles(&mut world, 0.01).hits.is_empty());
        }
    }

    #[test]
    fn test_projectile_stops_at_obstacle_and_expires() {
        let mut world = World::new(400.0, 400.0);
        let a = add_player(&mut world, 1, Vec2::new(50.0, 50.0));
        let rock = world
            .insert(|id| {
                Entity::Obstacle(Obstacle {
                    id,
                    type_name: "stone_01",
                    pos: Vec2::new(50.0, 60.0),
                    ori: 0,
                    scale: 1.0,
                    layer: LAYER_GROUND,
                    collider: Collider::circle(Vec2::new(50.0, 60.0), 2.0),
                    health: 100.0,
                    max_health: 100.0,
                    destructible: true,
                    dead: false,
                    parent: None,
                    loot: None,
                })
            })
            .unwrap();

        let mut player = shooter(&world, a);
        player.input.aim = Vec2::new(0.0, 1.0);
        CombatSystem::fire(&mut world, &player, &WeaponStats::default()).unwrap();
        let step = (0..50)
            .map(|_| CombatSystem::step_projectiles(&mut world, 0.01))
            .find(|s| !s.hits.is_empty())
            .unwrap();
        assert_eq!(step.hits[0].target, HitTarget::Obstacle(rock));

        player.input.aim = Vec2::new(1.0, 0.0);
        let stats = WeaponStats {
            range: 1.0,
            ..WeaponStats::default()
        };
        let shot = CombatSystem::fire(&mut world, &player, &stats).unwrap();
        let expired: Vec<EntityId> = (0..5)
            .flat_map(|_| CombatSystem::step_projectiles(&mut world, 0.01).expired)
            .collect();
        assert!(expired.contains(&shot));
    }
}
