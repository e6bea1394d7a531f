//! Seeded randomness for deterministic map generation and gameplay

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::geom::{Aabb, Vec2};

/// Deterministic RNG; equal seeds produce equal sequences on every platform
#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: ChaCha8Rng,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Uniform in `[0, 1)`
    pub fn next_f32(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }

    /// Uniform in `[min, max)`; returns `min` for an empty range
    pub fn range(&mut self, min: f32, max: f32) -> f32 {
        if max <= min {
            return min;
        }
        self.inner.gen_range(min..max)
    }

    /// Uniform integer in `[min, max]`
    pub fn int_range(&mut self, min: i32, max: i32) -> i32 {
        if max <= min {
            return min;
        }
        self.inner.gen_range(min..=max)
    }

    /// Uniform index into a collection of `len` items
    pub fn index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.inner.gen_range(0..len)
    }

    pub fn chance(&mut self, p: f32) -> bool {
        self.next_f32() < p
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let i = self.index(items.len());
        items.get(i)
    }

    /// Pick proportionally to the weight returned by `weight`
    pub fn weighted<'a, T>(&mut self, items: &'a [T], weight: impl Fn(&T) -> f32) -> Option<&'a T> {
        let total: f32 = items.iter().map(|i| weight(i).max(0.0)).sum();
        if total <= 0.0 {
            return items.first();
        }

        let mut roll = self.range(0.0, total);
        for item in items {
            let w = weight(item).max(0.0);
            if roll < w {
                return Some(item);
            }
            roll -= w;
        }
        items.last()
    }

    pub fn unit_vec(&mut self) -> Vec2 {
        Vec2::from_angle(self.range(0.0, std::f32::consts::TAU))
    }

    /// Uniformly distributed point inside a circle around the origin
    pub fn point_in_circle(&mut self, rad: f32) -> Vec2 {
        let r = rad * self.next_f32().sqrt();
        self.unit_vec() * r
    }

    pub fn point_in_aabb(&mut self, aabb: &Aabb) -> Vec2 {
        Vec2::new(
            self.range(aabb.min.x, aabb.max.x),
            self.range(aabb.min.y, aabb.max.y),
        )
    }
}

/// Random hex token of `bytes` bytes, used for game ids and join tokens
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SeededRng::new(42);
        let mut b = SeededRng::new(42);
        for _ in 0..32 {
            assert_eq!(a.range(0.0, 100.0), b.range(0.0, 100.0));
        }
    }

    #[test]
    fn test_degenerate_ranges() {
        let mut rng = SeededRng::new(1);
        assert_eq!(rng.range(5.0, 5.0), 5.0);
        assert_eq!(rng.int_range(3, 3), 3);
        assert_eq!(rng.index(0), 0);
        assert!(rng.pick::<u8>(&[]).is_none());
    }

    #[test]
    fn test_point_in_circle_bounded() {
        let mut rng = SeededRng::new(9);
        for _ in 0..200 {
            assert!(rng.point_in_circle(10.0).length() <= 10.0 + 1e-4);
        }
    }

    #[test]
    fn test_random_token_is_hex() {
        let token = random_token(20);
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
