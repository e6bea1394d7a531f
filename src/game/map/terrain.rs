//! Rivers, lakes and the shore/grass outline of a generated map

use std::f32::consts::{FRAC_PI_2, TAU};

use serde::Serialize;

use crate::defs::maps::{LakeDef, RiverMask};
use crate::geom::poly::{point_in_polygon, polygon_bounds};
use crate::geom::{Aabb, Vec2};
use crate::util::rng::SeededRng;

const SAMPLES_PER_SEGMENT: usize = 6;
const RIVER_STEP_MIN: f32 = 18.0;
const RIVER_STEP_MAX: f32 = 28.0;
const RIVER_TURN: f32 = 0.25;
const RIVER_MAX_DRIFT: f32 = 0.6;
const RIVER_MAX_POINTS: usize = 200;
const OUTLINE_STEP: f32 = 12.0;

/// River centerline as generated; this is what clients rebuild rivers from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiverDesc {
    pub width: f32,
    pub points: Vec<Vec2>,
    pub looped: bool,
}

/// Catmull-Rom curve sampled into a polyline and parameterized by arc length
#[derive(Debug, Clone)]
pub struct Spline {
    points: Vec<Vec2>,
    lengths: Vec<f32>,
    total: f32,
}

impl Spline {
    pub fn new(control: &[Vec2], looped: bool) -> Self {
        let mut ctrl: Vec<Vec2> = control.to_vec();
        if looped && ctrl.len() > 2 && ctrl.first() == ctrl.last() {
            ctrl.pop();
        }

        let n = ctrl.len();
        let mut points = Vec::new();
        if n < 2 {
            points.extend(ctrl.iter().copied());
        } else {
            let segments = if looped { n } else { n - 1 };
            let at = |i: isize| -> Vec2 {
                if looped {
                    ctrl[i.rem_euclid(n as isize) as usize]
                } else {
                    ctrl[i.clamp(0, n as isize - 1) as usize]
                }
            };
            for s in 0..segments as isize {
                let (p0, p1, p2, p3) = (at(s - 1), at(s), at(s + 1), at(s + 2));
                for k in 0..SAMPLES_PER_SEGMENT {
                    let t = k as f32 / SAMPLES_PER_SEGMENT as f32;
                    points.push(catmull_rom(p0, p1, p2, p3, t));
                }
            }
            points.push(if looped { ctrl[0] } else { ctrl[n - 1] });
        }

        let mut lengths = Vec::with_capacity(points.len());
        let mut total = 0.0;
        for (i, p) in points.iter().enumerate() {
            if i > 0 {
                total += p.distance(points[i - 1]);
            }
            lengths.push(total);
        }

        Self { points, lengths, total }
    }

    pub fn points(&self) -> &[Vec2] {
        &self.points
    }

    pub fn length(&self) -> f32 {
        self.total
    }

    /// Sample segment holding arc fraction `t` and the local blend inside it
    fn locate(&self, t: f32) -> (usize, f32) {
        if self.points.len() < 2 || self.total <= 0.0 {
            return (0, 0.0);
        }
        let dist = t.clamp(0.0, 1.0) * self.total;
        let idx = match self.lengths.binary_search_by(|l| l.total_cmp(&dist)) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
        .min(self.points.len() - 2);
        let seg = self.lengths[idx + 1] - self.lengths[idx];
        let local = if seg > 0.0 { (dist - self.lengths[idx]) / seg } else { 0.0 };
        (idx, local.clamp(0.0, 1.0))
    }

    pub fn pos_at(&self, t: f32) -> Vec2 {
        match self.points.len() {
            0 => Vec2::ZERO,
            1 => self.points[0],
            _ => {
                let (i, local) = self.locate(t);
                self.points[i].lerp(self.points[i + 1], local)
            }
        }
    }

    pub fn tangent_at(&self, t: f32) -> Vec2 {
        if self.points.len() < 2 {
            return Vec2::new(1.0, 0.0);
        }
        let (i, _) = self.locate(t);
        (self.points[i + 1] - self.points[i]).normalize()
    }

    pub fn normal_at(&self, t: f32) -> Vec2 {
        self.tangent_at(t).perp()
    }

    /// Arc fraction of the point on the curve closest to `p`
    pub fn closest_t(&self, p: Vec2) -> f32 {
        if self.points.len() < 2 || self.total <= 0.0 {
            return 0.0;
        }
        let mut best = (f32::MAX, 0.0);
        for i in 0..self.points.len() - 1 {
            let (a, b) = (self.points[i], self.points[i + 1]);
            let ab = b - a;
            let len_sq = ab.length_sq();
            let local = if len_sq > 0.0 {
                ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let dist = p.distance_sq(a + ab * local);
            if dist < best.0 {
                let along = self.lengths[i] + (self.lengths[i + 1] - self.lengths[i]) * local;
                best = (dist, along / self.total);
            }
        }
        best.1
    }
}

fn catmull_rom(p0: Vec2, p1: Vec2, p2: Vec2, p3: Vec2, t: f32) -> Vec2 {
    let t2 = t * t;
    let t3 = t2 * t;
    (p1 * 2.0 + (p2 - p0) * t + (p0 * 2.0 - p1 * 5.0 + p2 * 4.0 - p3) * t2
        + (-p0 + p1 * 3.0 - p2 * 3.0 + p3) * t3)
        * 0.5
}

#[derive(Debug, Clone)]
pub struct River {
    /// Half width of the water band
    pub water_width: f32,
    pub shore_width: f32,
    pub looped: bool,
    pub spline: Spline,
    pub water_poly: Vec<Vec2>,
    pub shore_poly: Vec<Vec2>,
    pub aabb: Aabb,
}

impl River {
    pub fn new(desc: &RiverDesc) -> Self {
        let spline = Spline::new(&desc.points, desc.looped);
        let water_width = desc.width;
        let shore_width = (water_width * 0.75).clamp(4.0, 8.0);

        let water_poly = offset_polygon(spline.points(), water_width, desc.looped);
        let shore_poly = offset_polygon(spline.points(), water_width + shore_width, desc.looped);
        let aabb = polygon_bounds(&shore_poly)
            .unwrap_or_else(|| Aabb::from_center(spline.pos_at(0.0), 1.0, 1.0));

        Self {
            water_width,
            shore_width,
            looped: desc.looped,
            spline,
            water_poly,
            shore_poly,
            aabb,
        }
    }

    pub fn in_water(&self, p: Vec2) -> bool {
        self.aabb.contains_point(p) && point_in_polygon(p, &self.water_poly)
    }

    pub fn on_shore(&self, p: Vec2) -> bool {
        self.aabb.contains_point(p) && point_in_polygon(p, &self.shore_poly)
    }
}

/// Band of half width `dist` around an open line, or the filled outline of a
/// closed ring pushed outward by `dist`
fn offset_polygon(line: &[Vec2], dist: f32, looped: bool) -> Vec<Vec2> {
    let n = line.len();
    if n < 2 {
        return Vec::new();
    }

    let normal = |i: usize| -> Vec2 {
        let prev = line[i.saturating_sub(1)];
        let next = line[(i + 1).min(n - 1)];
        (next - prev).normalize().perp()
    };

    if looped {
        let centroid = line.iter().fold(Vec2::ZERO, |acc, p| acc + *p) * (1.0 / n as f32);
        return (0..n)
            .map(|i| {
                let mut nrm = normal(i);
                if nrm.dot(line[i] - centroid) < 0.0 {
                    nrm = -nrm;
                }
                line[i] + nrm * dist
            })
            .collect();
    }

    let mut poly: Vec<Vec2> = (0..n).map(|i| line[i] + normal(i) * dist).collect();
    poly.extend((0..n).rev().map(|i| line[i] - normal(i) * dist));
    poly
}

/// Closed ring of points around a lake center
pub fn generate_lake(def: &LakeDef, map_size: Vec2, rng: &mut SeededRng) -> (RiverDesc, Vec2) {
    let center = def.spawn_pos.mul_elems(map_size) + rng.point_in_circle(def.spawn_rad);

    let start_len = def.outer_rad - def.inner_rad;
    let mut len = start_len;
    let mut points = Vec::new();
    let mut angle = 0.0;
    while angle < TAU {
        let dir = Vec2::new(angle.sin(), angle.cos());
        len = (len + rng.range(-8.0, 8.0)).clamp(start_len - 10.0, start_len + 10.0);
        points.push(center + dir * len);
        angle += rng.range(0.2, 0.3);
    }
    if let Some(first) = points.first().copied() {
        points.push(first);
    }

    let desc = RiverDesc {
        width: (def.outer_rad - def.inner_rad) / 2.0,
        points,
        looped: true,
    };
    (desc, center)
}

/// Grows river centerlines across the map
pub struct RiverCreator<'a> {
    width: f32,
    height: f32,
    masks: &'a [RiverMask],
}

impl<'a> RiverCreator<'a> {
    pub fn new(width: f32, height: f32, masks: &'a [RiverMask]) -> Self {
        Self { width, height, masks }
    }

    fn bounds(&self) -> Aabb {
        Aabb::new(Vec2::ZERO, Vec2::new(self.width, self.height))
    }

    fn in_mask(&self, p: Vec2) -> bool {
        self.masks.iter().any(|m| {
            let pos = m.pos.mul_elems(Vec2::new(self.width, self.height));
            pos.distance(p) < m.rad
        })
    }

    fn point_on_edge(&self, rng: &mut SeededRng) -> Vec2 {
        match rng.int_range(0, 3) {
            0 => Vec2::new(self.width, rng.range(0.0, self.height)),
            1 => Vec2::new(rng.range(0.0, self.width), self.height),
            2 => Vec2::new(0.0, rng.range(0.0, self.height)),
            _ => Vec2::new(rng.range(0.0, self.width), 0.0),
        }
    }

    /// One river from edge to edge. A faction river runs straight across the
    /// middle, perpendicular to the team split. May return fewer than two
    /// points, in which case the caller retries.
    pub fn create(&self, rng: &mut SeededRng, faction_split: Option<u8>) -> Vec<Vec2> {
        let center = Vec2::new(self.width / 2.0, self.height / 2.0);

        let (start, base_heading, max_drift) = match faction_split {
            Some(0) => (
                Vec2::new(0.0, center.y + rng.range(-10.0, 10.0)),
                0.0,
                0.2,
            ),
            Some(_) => (
                Vec2::new(center.x + rng.range(-10.0, 10.0), 0.0),
                FRAC_PI_2,
                0.2,
            ),
            None => {
                let start = self.point_on_edge(rng);
                let heading = (center - start).angle() + rng.range(-0.5, 0.5);
                (start, heading, RIVER_MAX_DRIFT)
            }
        };

        let bounds = self.bounds();
        let mut points = vec![start];
        let mut drift = 0.0f32;
        let mut pos = start;

        while points.len() < RIVER_MAX_POINTS {
            drift = (drift + rng.range(-RIVER_TURN, RIVER_TURN)).clamp(-max_drift, max_drift);
            let step = rng.range(RIVER_STEP_MIN, RIVER_STEP_MAX);
            let next = pos + Vec2::from_angle(base_heading + drift) * step;

            if self.in_mask(next) {
                break;
            }
            if !bounds.contains_point(next) {
                points.push(next.clamp(bounds.min, bounds.max));
                break;
            }
            points.push(next);
            pos = next;
        }

        // A river cut short right at its source is degenerate
        if points.len() == 2 && points[0].distance(points[1]) < RIVER_STEP_MIN * 0.5 {
            points.pop();
        }
        points
    }
}

/// Jittered ring inset from the map border
fn outline(width: f32, height: f32, inset: f32, jitter: f32, rng: &mut SeededRng) -> Vec<Vec2> {
    let corners = [
        Vec2::new(inset, inset),
        Vec2::new(width - inset, inset),
        Vec2::new(width - inset, height - inset),
        Vec2::new(inset, height - inset),
    ];

    let mut ring = Vec::new();
    for i in 0..4 {
        let (a, b) = (corners[i], corners[(i + 1) % 4]);
        let steps = ((a.distance(b) / OUTLINE_STEP).ceil() as usize).max(1);
        let inward = (b - a).normalize().perp();
        for s in 0..steps {
            let p = a.lerp(b, s as f32 / steps as f32);
            let offset = if s == 0 { 0.0 } else { rng.range(-jitter, jitter) };
            ring.push(p + inward * offset);
        }
    }
    ring
}

#[derive(Debug, Clone)]
pub struct Terrain {
    /// Everything outside this ring is ocean
    pub shore: Vec<Vec2>,
    pub grass: Vec<Vec2>,
    /// Lakes first, then rivers, in generation order
    pub rivers: Vec<River>,
}

impl Terrain {
    pub fn generate(
        width: f32,
        height: f32,
        shore_inset: f32,
        grass_inset: f32,
        descs: &[RiverDesc],
        rng: &mut SeededRng,
    ) -> Self {
        let shore = outline(width, height, shore_inset, 2.5, rng);
        let grass = outline(width, height, shore_inset + grass_inset, 2.0, rng);
        let rivers = descs.iter().map(River::new).collect();
        Self { shore, grass, rivers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight() -> Spline {
        Spline::new(
            &[Vec2::new(0.0, 0.0), Vec2::new(50.0, 0.0), Vec2::new(100.0, 0.0)],
            false,
        )
    }

    #[test]
    fn test_spline_endpoints_and_closest() {
        let s = straight();
        assert!(s.pos_at(0.0).distance(Vec2::new(0.0, 0.0)) < 1e-3);
        assert!(s.pos_at(1.0).distance(Vec2::new(100.0, 0.0)) < 1e-3);
        assert!((s.pos_at(0.5).x - 50.0).abs() < 1.0);
        assert!((s.closest_t(Vec2::new(25.0, 10.0)) - 0.25).abs() < 0.02);
        assert!(s.normal_at(0.5).y.abs() > 0.99);
    }

    #[test]
    fn test_river_polygons() {
        let river = River::new(&RiverDesc {
            width: 8.0,
            points: vec![Vec2::new(0.0, 50.0), Vec2::new(50.0, 50.0), Vec2::new(100.0, 50.0)],
            looped: false,
        });
        assert!(river.in_water(Vec2::new(50.0, 55.0)));
        assert!(!river.in_water(Vec2::new(50.0, 60.0)));
        assert!(river.on_shore(Vec2::new(50.0, 60.0)));
        assert!(!river.on_shore(Vec2::new(50.0, 70.0)));
        assert!((river.shore_width - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_lake_is_closed_and_filled() {
        let def = LakeDef {
            inner_rad: 30.0,
            outer_rad: 64.0,
            spawn_pos: Vec2::new(0.5, 0.5),
            spawn_rad: 0.0,
        };
        let mut rng = SeededRng::new(9);
        let (desc, center) = generate_lake(&def, Vec2::new(400.0, 400.0), &mut rng);
        assert!(desc.looped);
        assert_eq!(desc.points.first(), desc.points.last());
        assert!((desc.width - 17.0).abs() < 1e-5);

        let lake = River::new(&desc);
        assert!(lake.in_water(center));
    }

    #[test]
    fn test_rivers_cross_the_map() {
        let creator = RiverCreator::new(600.0, 600.0, &[]);
        let mut rng = SeededRng::new(3);
        for _ in 0..20 {
            let points = creator.create(&mut rng, None);
            assert!(points.len() >= 2);
            let bounds = Aabb::new(Vec2::ZERO, Vec2::new(600.0, 600.0));
            assert!(points.iter().all(|p| bounds.contains_point(*p)));
        }
    }

    #[test]
    fn test_faction_river_splits_the_map() {
        let creator = RiverCreator::new(600.0, 600.0, &[]);
        let mut rng = SeededRng::new(5);
        let points = creator.create(&mut rng, Some(0));
        let last = points.last().copied().unwrap();
        assert!((last.x - 600.0).abs() < 1e-3);
        assert!(points.iter().all(|p| (p.y - 300.0).abs() < 150.0));
    }

    #[test]
    fn test_masks_stop_rivers() {
        let masks = [RiverMask {
            pos: Vec2::new(0.5, 0.5),
            rad: 90.0,
        }];
        let creator = RiverCreator::new(600.0, 600.0, &masks);
        let mut rng = SeededRng::new(11);
        for _ in 0..20 {
            let points = creator.create(&mut rng, None);
            assert!(points.iter().all(|p| p.distance(Vec2::new(300.0, 300.0)) >= 90.0));
        }
    }
}
