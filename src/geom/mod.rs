//! Geometry primitives shared by the grid, the map generator and gameplay

pub mod collider;
pub mod poly;
pub mod vec2;

pub use collider::{Aabb, Circle, Collider};
pub use vec2::Vec2;

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, TAU};

/// Nearest quarter-turn orientation (0..=3) for an angle in radians
pub fn rad_to_ori(rad: f32) -> u8 {
    let wrapped = (rad + FRAC_PI_4).rem_euclid(TAU);
    ((wrapped / FRAC_PI_2).floor() as u8) % 4
}

pub fn ori_to_rad(ori: u8) -> f32 {
    (ori % 4) as f32 * FRAC_PI_2
}

/// Rotate by `ori` quarter turns without trig error
pub fn rotate_by_ori(v: Vec2, ori: u8) -> Vec2 {
    match ori % 4 {
        0 => v,
        1 => Vec2::new(-v.y, v.x),
        2 => Vec2::new(-v.x, -v.y),
        _ => Vec2::new(v.y, -v.x),
    }
}

/// Offset given in an object's local frame, moved into world space
pub fn add_adjust(pos: Vec2, offset: Vec2, ori: u8) -> Vec2 {
    pos + rotate_by_ori(offset, ori)
}
