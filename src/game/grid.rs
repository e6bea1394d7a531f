//! Uniform spatial grid over world-space entity bounds
//!
//! Cells are `CELL_SIZE` world units square. An entity is listed in every cell
//! its bounds touch, so queries are conservative: they may return entities
//! that only share a cell with the query shape, but never miss one that
//! overlaps it. Coordinates outside the grid clamp to the border cells.

use std::collections::HashMap;

use crate::geom::{Aabb, Vec2};

use super::entity::EntityId;

pub const CELL_SIZE: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellRange {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
}

impl CellRange {
    fn cells(self) -> impl Iterator<Item = (usize, usize)> {
        (self.min_y..=self.max_y).flat_map(move |y| (self.min_x..=self.max_x).map(move |x| (x, y)))
    }
}

#[derive(Debug, Clone)]
struct GridEntry {
    bounds: Aabb,
    range: CellRange,
}

#[derive(Debug, Clone)]
pub struct SpatialGrid {
    width: usize,
    height: usize,
    cells: Vec<Vec<EntityId>>,
    entries: HashMap<EntityId, GridEntry>,
}

impl SpatialGrid {
    /// Grid covering `[0, world_width] x [0, world_height]`
    pub fn new(world_width: f32, world_height: f32) -> Self {
        let width = (world_width.max(0.0) / CELL_SIZE).ceil() as usize + 1;
        let height = (world_height.max(0.0) / CELL_SIZE).ceil() as usize + 1;
        Self {
            width,
            height,
            cells: vec![Vec::new(); width * height],
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Add an entity, or move it if it is already present
    pub fn insert(&mut self, id: EntityId, bounds: Aabb) {
        if self.entries.contains_key(&id) {
            self.update(id, bounds);
            return;
        }

        let range = self.range_for(&bounds);
        for (x, y) in range.cells() {
            let idx = self.index(x, y);
            self.cells[idx].push(id);
        }
        self.entries.insert(id, GridEntry { bounds, range });
    }

    /// Remove an entity; false if the grid does not hold it
    pub fn remove(&mut self, id: EntityId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        for (x, y) in entry.range.cells() {
            let idx = self.index(x, y);
            self.cells[idx].retain(|e| *e != id);
        }
        true
    }

    /// Refresh an entity's cells after it moved; false if it is unknown
    pub fn update(&mut self, id: EntityId, bounds: Aabb) -> bool {
        let new_range = self.range_for(&bounds);
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.bounds = bounds;

        let old_range = entry.range;
        if old_range == new_range {
            return true;
        }
        entry.range = new_range;

        for (x, y) in old_range.cells() {
            let idx = y * self.width + x;
            self.cells[idx].retain(|e| *e != id);
        }
        for (x, y) in new_range.cells() {
            let idx = y * self.width + x;
            self.cells[idx].push(id);
        }
        true
    }

    /// Entities whose cells overlap `aabb`, sorted and deduplicated
    pub fn query_rect(&self, aabb: &Aabb) -> Vec<EntityId> {
        let range = self.range_for(aabb);
        let mut out = Vec::new();
        for (x, y) in range.cells() {
            out.extend_from_slice(&self.cells[self.index(x, y)]);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn query_circle(&self, center: Vec2, rad: f32) -> Vec<EntityId> {
        self.query_rect(&Aabb::from_center(center, rad, rad))
    }

    pub fn query_point(&self, pos: Vec2) -> Vec<EntityId> {
        self.query_rect(&Aabb::new(pos, pos))
    }

    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    fn cell_coord(&self, v: f32, cells: usize) -> usize {
        if !v.is_finite() || v <= 0.0 {
            return 0;
        }
        ((v / CELL_SIZE) as usize).min(cells - 1)
    }

    fn range_for(&self, aabb: &Aabb) -> CellRange {
        CellRange {
            min_x: self.cell_coord(aabb.min.x, self.width),
            min_y: self.cell_coord(aabb.min.y, self.height),
            max_x: self.cell_coord(aabb.max.x, self.width),
            max_y: self.cell_coord(aabb.max.y, self.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn boxed(x: f32, y: f32, r: f32) -> Aabb {
        Aabb::from_center(Vec2::new(x, y), r, r)
    }

    #[test]
    fn test_insert_query_remove() {
        let mut grid = SpatialGrid::new(256.0, 256.0);
        grid.insert(1, boxed(20.0, 20.0, 2.0));
        grid.insert(2, boxed(200.0, 200.0, 2.0));

        assert_eq!(grid.query_circle(Vec2::new(21.0, 21.0), 3.0), vec![1]);
        assert!(grid.remove(1));
        assert!(!grid.remove(1));
        assert!(grid.query_circle(Vec2::new(21.0, 21.0), 3.0).is_empty());
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_out_of_bounds_clamps_to_border() {
        let mut grid = SpatialGrid::new(64.0, 64.0);
        grid.insert(7, boxed(-50.0, -50.0, 1.0));
        grid.insert(8, boxed(500.0, 500.0, 1.0));
        assert_eq!(grid.query_point(Vec2::new(0.0, 0.0)), vec![7]);
        assert_eq!(grid.query_point(Vec2::new(64.0, 64.0)), vec![8]);
    }

    #[test]
    fn test_update_unknown_id() {
        let mut grid = SpatialGrid::new(64.0, 64.0);
        assert!(!grid.update(3, boxed(1.0, 1.0, 1.0)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16, f32, f32, f32),
        Move(u16, f32, f32, f32),
        Remove(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        let id = 1u16..40;
        prop_oneof![
            (id.clone(), -20.0f32..520.0, -20.0f32..520.0, 0.1f32..30.0)
                .prop_map(|(i, x, y, r)| Op::Insert(i, x, y, r)),
            (id.clone(), -20.0f32..520.0, -20.0f32..520.0, 0.1f32..30.0)
                .prop_map(|(i, x, y, r)| Op::Move(i, x, y, r)),
            id.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_queries_have_no_false_negatives(
            ops in prop::collection::vec(op(), 1..120),
            qx in -20.0f32..520.0,
            qy in -20.0f32..520.0,
            qr in 0.0f32..60.0,
        ) {
            let mut grid = SpatialGrid::new(500.0, 500.0);
            let mut truth: HashMap<EntityId, Aabb> = HashMap::new();

            for op in ops {
                match op {
                    Op::Insert(id, x, y, r) => {
                        grid.insert(id, boxed(x, y, r));
                        truth.insert(id, boxed(x, y, r));
                    }
                    Op::Move(id, x, y, r) => {
                        let known = grid.update(id, boxed(x, y, r));
                        prop_assert_eq!(known, truth.contains_key(&id));
                        if known {
                            truth.insert(id, boxed(x, y, r));
                        }
                    }
                    Op::Remove(id) => {
                        prop_assert_eq!(grid.remove(id), truth.remove(&id).is_some());
                    }
                }
            }

            let query = boxed(qx, qy, qr);
            let found = grid.query_rect(&query);
            for (id, b) in &truth {
                if b.intersects(&query) {
                    prop_assert!(found.contains(id), "missed entity {}", id);
                }
            }
            for id in &found {
                prop_assert!(truth.contains_key(id), "stale entity {}", id);
            }
        }
    }
}
