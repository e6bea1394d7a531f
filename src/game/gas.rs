//! Shrinking safe zone ("gas")

use crate::defs::maps::{GasStageDef, GasStageMode};
use crate::geom::Vec2;
use crate::util::rng::SeededRng;

/// What changed during one gas update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasUpdate {
    pub stage_changed: bool,
    /// The stage that just started drops an airdrop
    pub airdrop: bool,
}

#[derive(Debug, Clone)]
pub struct Gas {
    stages: Vec<GasStageDef>,
    map_size: f32,
    pub stage: usize,
    pub mode: GasStageMode,
    pub duration: f32,
    /// Seconds spent in the current stage
    pub elapsed: f32,
    pub pos_old: Vec2,
    pub pos_new: Vec2,
    pub rad_old: f32,
    pub rad_new: f32,
    pub current_pos: Vec2,
    pub current_rad: f32,
    /// Damage per second outside the safe zone
    pub damage: f32,
    /// Stage or circles changed and clients need the full gas state
    pub dirty: bool,
    /// Circle moved this tick
    pub time_dirty: bool,
}

impl Gas {
    pub fn new(stages: &[GasStageDef], map_width: f32, map_height: f32) -> Self {
        let map_size = map_width.max(map_height);
        let center = Vec2::new(map_width / 2.0, map_height / 2.0);
        let first = stages.first();
        let rad = first.map(|s| s.rad).unwrap_or(1.0) * map_size;

        Self {
            stages: stages.to_vec(),
            map_size,
            stage: 0,
            mode: first.map(|s| s.mode).unwrap_or(GasStageMode::Inactive),
            duration: first.map(|s| s.duration).unwrap_or(0.0),
            elapsed: 0.0,
            pos_old: center,
            pos_new: center,
            rad_old: rad,
            rad_new: rad,
            current_pos: center,
            current_rad: rad,
            damage: first.map(|s| s.damage).unwrap_or(0.0),
            dirty: true,
            time_dirty: false,
        }
    }

    pub fn is_final_stage(&self) -> bool {
        self.stage + 1 >= self.stages.len()
    }

    /// Leave the inactive stage; no-op once the gas is running
    pub fn start(&mut self, rng: &mut SeededRng) -> GasUpdate {
        if self.mode != GasStageMode::Inactive || self.is_final_stage() {
            return GasUpdate::default();
        }
        self.advance(rng)
    }

    pub fn is_running(&self) -> bool {
        self.mode != GasStageMode::Inactive
    }

    /// Fraction of the current stage elapsed
    pub fn progress(&self) -> f32 {
        if self.duration > 0.0 {
            (self.elapsed / self.duration).clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    pub fn is_outside(&self, pos: Vec2) -> bool {
        pos.distance_sq(self.current_pos) >= self.current_rad * self.current_rad
    }

    pub fn update(&mut self, dt: f32, rng: &mut SeededRng) -> GasUpdate {
        self.time_dirty = false;
        if self.mode == GasStageMode::Inactive {
            return GasUpdate::default();
        }

        self.elapsed += dt;
        if self.mode == GasStageMode::Moving {
            let t = self.progress();
            self.current_pos = self.pos_old.lerp(self.pos_new, t);
            self.current_rad = self.rad_old + (self.rad_new - self.rad_old) * t;
            self.time_dirty = true;
        }

        if self.elapsed < self.duration || self.is_final_stage() {
            self.elapsed = self.elapsed.min(self.duration);
            return GasUpdate::default();
        }
        self.advance(rng)
    }

    fn advance(&mut self, rng: &mut SeededRng) -> GasUpdate {
        if self.mode == GasStageMode::Moving {
            self.pos_old = self.pos_new;
            self.rad_old = self.rad_new;
            self.current_pos = self.pos_new;
            self.current_rad = self.rad_new;
        }

        self.stage += 1;
        let def = self.stages[self.stage];
        self.mode = def.mode;
        self.duration = def.duration;
        self.elapsed = 0.0;
        self.damage = def.damage;

        if def.mode == GasStageMode::Waiting {
            // The next circle always lies entirely inside the current one
            self.rad_new = (def.rad * self.map_size).min(self.rad_old);
            self.pos_new = self.pos_old + rng.point_in_circle(self.rad_old - self.rad_new);
        }

        self.dirty = true;
        GasUpdate {
            stage_changed: true,
            airdrop: def.airdrop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::map_def;

    fn gas() -> (Gas, SeededRng) {
        let def = map_def("main").unwrap();
        (Gas::new(&def.gas, 720.0, 720.0), SeededRng::new(3))
    }

    #[test]
    fn test_inactive_until_started() {
        let (mut gas, mut rng) = gas();
        let rad = gas.current_rad;
        assert_eq!(gas.update(500.0, &mut rng), GasUpdate::default());
        assert_eq!(gas.stage, 0);
        assert_eq!(gas.current_rad, rad);

        let update = gas.start(&mut rng);
        assert!(update.stage_changed);
        assert_eq!(gas.mode, GasStageMode::Waiting);
        assert!(gas.start(&mut rng) == GasUpdate::default());
    }

    #[test]
    fn test_new_circle_inside_old() {
        let (mut gas, mut rng) = gas();
        gas.start(&mut rng);
        while !gas.is_final_stage() {
            let dist = gas.pos_new.distance(gas.pos_old);
            assert!(dist + gas.rad_new <= gas.rad_old + 1e-3);
            gas.update(gas.duration + 0.01, &mut rng);
        }
    }

    #[test]
    fn test_moving_stage_shrinks_radius() {
        let (mut gas, mut rng) = gas();
        gas.start(&mut rng);
        gas.update(gas.duration + 0.01, &mut rng);
        assert_eq!(gas.mode, GasStageMode::Moving);

        let start = gas.current_rad;
        gas.update(gas.duration / 2.0, &mut rng);
        assert!(gas.time_dirty);
        assert!(gas.current_rad < start);
        assert!(gas.current_rad > gas.rad_new);
    }

    #[test]
    fn test_airdrop_flag_follows_stage_def() {
        let (mut gas, mut rng) = gas();
        gas.start(&mut rng);
        let mut airdrops = 0;
        while !gas.is_final_stage() {
            if gas.update(gas.duration + 0.01, &mut rng).airdrop {
                airdrops += 1;
            }
        }
        assert_eq!(airdrops, 2);
    }

    #[test]
    fn test_outside_check() {
        let (gas, _) = gas();
        assert!(!gas.is_outside(gas.current_pos));
        assert!(gas.is_outside(gas.current_pos + Vec2::new(gas.current_rad + 1.0, 0.0)));
    }
}
