//! Collider shapes and intersection tests
//!
//! Map geometry only ever uses axis-aligned boxes and circles. Objects rotate
//! in quarter turns, so a rotated box is still axis aligned.

use serde::{Deserialize, Serialize};

use super::{rotate_by_ori, Vec2};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    /// Box spanning two corners in any order
    pub fn new(a: Vec2, b: Vec2) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn from_center(center: Vec2, half_width: f32, half_height: f32) -> Self {
        let half = Vec2::new(half_width, half_height);
        Self::new(center - half, center + half)
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn contains_point(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// True when `other` lies completely inside this box
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    pub fn intersects_circle(&self, center: Vec2, rad: f32) -> bool {
        let closest = center.clamp(self.min, self.max);
        closest.distance_sq(center) <= rad * rad
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn expand(&self, amount: f32) -> Aabb {
        let v = Vec2::new(amount, amount);
        Aabb {
            min: self.min - v,
            max: self.max + v,
        }
    }

    pub fn corners(&self) -> [Vec2; 4] {
        [
            self.min,
            Vec2::new(self.max.x, self.min.y),
            self.max,
            Vec2::new(self.min.x, self.max.y),
        ]
    }

    /// Local-space box placed at `pos`, turned by `ori` quarter turns and scaled
    pub fn transform(&self, pos: Vec2, ori: u8, scale: f32) -> Aabb {
        let a = rotate_by_ori(self.min * scale, ori);
        let b = rotate_by_ori(self.max * scale, ori);
        Aabb::new(a + pos, b + pos)
    }

    /// Bounding box of a set of boxes; `None` for an empty set
    pub fn bounding<'a>(boxes: impl IntoIterator<Item = &'a Aabb>) -> Option<Aabb> {
        boxes.into_iter().fold(None, |acc, b| match acc {
            None => Some(*b),
            Some(a) => Some(a.union(b)),
        })
    }

    /// Split into `divisions` equal slices along the dominant axis of `dir`,
    /// ordered in the direction `dir` points.
    pub fn divide(&self, dir: Vec2, divisions: usize) -> Vec<Aabb> {
        let divisions = divisions.max(1);
        let along_x = dir.x.abs() >= dir.y.abs();
        let forward = if along_x { dir.x >= 0.0 } else { dir.y >= 0.0 };

        let mut slices: Vec<Aabb> = (0..divisions)
            .map(|i| {
                let t0 = i as f32 / divisions as f32;
                let t1 = (i + 1) as f32 / divisions as f32;
                if along_x {
                    let x0 = self.min.x + self.width() * t0;
                    let x1 = self.min.x + self.width() * t1;
                    Aabb::new(Vec2::new(x0, self.min.y), Vec2::new(x1, self.max.y))
                } else {
                    let y0 = self.min.y + self.height() * t0;
                    let y1 = self.min.y + self.height() * t1;
                    Aabb::new(Vec2::new(self.min.x, y0), Vec2::new(self.max.x, y1))
                }
            })
            .collect();

        if !forward {
            slices.reverse();
        }
        slices
    }
}

/// Circle collider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub pos: Vec2,
    pub rad: f32,
}

impl Circle {
    pub fn new(pos: Vec2, rad: f32) -> Self {
        Self { pos, rad }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_center(self.pos, self.rad, self.rad)
    }

    pub fn transform(&self, pos: Vec2, ori: u8, scale: f32) -> Circle {
        Circle {
            pos: pos + rotate_by_ori(self.pos * scale, ori),
            rad: self.rad * scale,
        }
    }

    pub fn intersects_circle(&self, pos: Vec2, rad: f32) -> bool {
        let r = self.rad + rad;
        self.pos.distance_sq(pos) <= r * r
    }
}

/// A collision shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Collider {
    Aabb(Aabb),
    Circle(Circle),
}

impl Collider {
    pub fn aabb(min: Vec2, max: Vec2) -> Self {
        Collider::Aabb(Aabb::new(min, max))
    }

    pub fn circle(pos: Vec2, rad: f32) -> Self {
        Collider::Circle(Circle::new(pos, rad))
    }

    pub fn bounds(&self) -> Aabb {
        match self {
            Collider::Aabb(a) => *a,
            Collider::Circle(c) => c.bounds(),
        }
    }

    pub fn transform(&self, pos: Vec2, ori: u8, scale: f32) -> Collider {
        match self {
            Collider::Aabb(a) => Collider::Aabb(a.transform(pos, ori, scale)),
            Collider::Circle(c) => Collider::Circle(c.transform(pos, ori, scale)),
        }
    }

    pub fn intersects(&self, other: &Collider) -> bool {
        match (self, other) {
            (Collider::Aabb(a), Collider::Aabb(b)) => a.intersects(b),
            (Collider::Aabb(a), Collider::Circle(c)) | (Collider::Circle(c), Collider::Aabb(a)) => {
                a.intersects_circle(c.pos, c.rad)
            }
            (Collider::Circle(a), Collider::Circle(b)) => a.intersects_circle(b.pos, b.rad),
        }
    }

    pub fn intersects_circle(&self, pos: Vec2, rad: f32) -> bool {
        match self {
            Collider::Aabb(a) => a.intersects_circle(pos, rad),
            Collider::Circle(c) => c.intersects_circle(pos, rad),
        }
    }

    pub fn contains_point(&self, p: Vec2) -> bool {
        match self {
            Collider::Aabb(a) => a.contains_point(p),
            Collider::Circle(c) => c.pos.distance_sq(p) <= c.rad * c.rad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_quarter_turn_stays_axis_aligned() {
        let local = Aabb::new(Vec2::new(-4.0, -1.0), Vec2::new(4.0, 1.0));
        let turned = local.transform(Vec2::new(10.0, 10.0), 1, 1.0);
        assert!((turned.width() - 2.0).abs() < 1e-4);
        assert!((turned.height() - 8.0).abs() < 1e-4);
        assert!((turned.center().x - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_circle_aabb_intersection() {
        let b = Collider::aabb(Vec2::new(0.0, 0.0), Vec2::new(2.0, 2.0));
        assert!(b.intersects(&Collider::circle(Vec2::new(3.0, 1.0), 1.1)));
        assert!(!b.intersects(&Collider::circle(Vec2::new(4.0, 4.0), 1.0)));
    }

    #[test]
    fn test_divide_follows_direction() {
        let b = Aabb::new(Vec2::ZERO, Vec2::new(100.0, 10.0));
        let fwd = b.divide(Vec2::new(1.0, 0.0), 10);
        let back = b.divide(Vec2::new(-1.0, 0.0), 10);
        assert_eq!(fwd.len(), 10);
        assert!(fwd[0].min.x < 1e-4);
        assert!((back[0].max.x - 100.0).abs() < 1e-4);
    }
}
