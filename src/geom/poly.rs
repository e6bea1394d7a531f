//! Polygon tests used for water and shore regions

use super::{Aabb, Vec2};

/// Even-odd point in polygon test. The polygon may be open or closed.
pub fn point_in_polygon(p: Vec2, poly: &[Vec2]) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (poly[i], poly[j]);
        if (a.y > p.y) != (b.y > p.y) {
            let x = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Proper or touching intersection of segments `a0-a1` and `b0-b1`
pub fn segments_intersect(a0: Vec2, a1: Vec2, b0: Vec2, b1: Vec2) -> bool {
    let d1 = (b1 - b0).cross(a0 - b0);
    let d2 = (b1 - b0).cross(a1 - b0);
    let d3 = (a1 - a0).cross(b0 - a0);
    let d4 = (a1 - a0).cross(b1 - a0);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    let on_segment = |p: Vec2, q: Vec2, r: Vec2| {
        r.x >= p.x.min(q.x) && r.x <= p.x.max(q.x) && r.y >= p.y.min(q.y) && r.y <= p.y.max(q.y)
    };

    (d1 == 0.0 && on_segment(b0, b1, a0))
        || (d2 == 0.0 && on_segment(b0, b1, a1))
        || (d3 == 0.0 && on_segment(a0, a1, b0))
        || (d4 == 0.0 && on_segment(a0, a1, b1))
}

/// Any overlap between a box and a polygon's area or outline
pub fn aabb_intersects_polygon(aabb: &Aabb, poly: &[Vec2]) -> bool {
    if poly.len() < 3 {
        return false;
    }

    if poly.iter().any(|p| aabb.contains_point(*p)) {
        return true;
    }
    if aabb.corners().iter().any(|c| point_in_polygon(*c, poly)) {
        return true;
    }

    let corners = aabb.corners();
    let n = poly.len();
    for i in 0..n {
        let (p0, p1) = (poly[i], poly[(i + 1) % n]);
        for k in 0..4 {
            if segments_intersect(p0, p1, corners[k], corners[(k + 1) % 4]) {
                return true;
            }
        }
    }
    false
}

pub fn distance_to_segment(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_sq();
    if len_sq <= f32::EPSILON {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

pub fn polygon_bounds(poly: &[Vec2]) -> Option<Aabb> {
    let first = *poly.first()?;
    Some(poly.iter().fold(Aabb::new(first, first), |acc, p| Aabb {
        min: acc.min.min(*p),
        max: acc.max.max(*p),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Vec2> {
        vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(10.0, 0.0),
            Vec2::new(10.0, 10.0),
            Vec2::new(0.0, 10.0),
        ]
    }

    #[test]
    fn test_point_in_polygon() {
        let poly = square();
        assert!(point_in_polygon(Vec2::new(5.0, 5.0), &poly));
        assert!(!point_in_polygon(Vec2::new(15.0, 5.0), &poly));
    }

    #[test]
    fn test_aabb_polygon_edge_crossing() {
        let poly = square();
        // straddles the right edge without containing a vertex
        let b = Aabb::new(Vec2::new(9.0, 4.0), Vec2::new(11.0, 6.0));
        assert!(aabb_intersects_polygon(&b, &poly));
        let far = Aabb::new(Vec2::new(20.0, 20.0), Vec2::new(22.0, 22.0));
        assert!(!aabb_intersects_polygon(&far, &poly));
    }
}
