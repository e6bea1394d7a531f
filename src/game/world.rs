//! Entity registry: id pool, per-kind index, spatial grid and dirty tracking

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::error;

use crate::geom::Aabb;

use super::entity::{Entity, EntityId, EntityKind};
use super::grid::SpatialGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("entity id pool exhausted")]
pub struct IdsExhausted;

/// Hands out ids from 1 upward and reuses released ones first
#[derive(Debug, Default)]
struct IdPool {
    next: u32,
    free: VecDeque<EntityId>,
}

impl IdPool {
    fn new() -> Self {
        Self {
            next: 1,
            free: VecDeque::new(),
        }
    }

    fn alloc(&mut self) -> Result<EntityId, IdsExhausted> {
        if let Some(id) = self.free.pop_front() {
            return Ok(id);
        }
        if self.next > EntityId::MAX as u32 {
            return Err(IdsExhausted);
        }
        let id = self.next as EntityId;
        self.next += 1;
        Ok(id)
    }

    fn release(&mut self, id: EntityId) {
        self.free.push_back(id);
    }
}

/// Changes accumulated since the last net sync
#[derive(Debug, Default, Clone)]
pub struct DirtyFrame {
    /// Whole object must be resent
    pub full: BTreeSet<EntityId>,
    /// Only the frequently changing part must be resent
    pub part: BTreeSet<EntityId>,
    pub deleted: Vec<EntityId>,
}

impl DirtyFrame {
    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.part.is_empty() && self.deleted.is_empty()
    }
}

pub struct World {
    entities: BTreeMap<EntityId, Entity>,
    by_kind: [BTreeSet<EntityId>; 8],
    ids: IdPool,
    /// Deleted ids are only reusable after clients heard about the deletion
    pending_release: Vec<EntityId>,
    pub grid: SpatialGrid,
    dirty: DirtyFrame,
}

impl World {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            entities: BTreeMap::new(),
            by_kind: Default::default(),
            ids: IdPool::new(),
            pending_release: Vec::new(),
            grid: SpatialGrid::new(width, height),
            dirty: DirtyFrame::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Allocate an id, build the entity with it and index it
    pub fn insert(&mut self, build: impl FnOnce(EntityId) -> Entity) -> Result<EntityId, IdsExhausted> {
        let id = self.ids.alloc()?;
        let entity = build(id);
        debug_assert_eq!(entity.id(), id);

        self.grid.insert(id, entity.bounds());
        self.by_kind[entity.kind().index()].insert(id);
        self.entities.insert(id, entity);
        self.dirty.full.insert(id);
        Ok(id)
    }

    /// Drop an entity from every index. Returns it, or `None` if it was unknown.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        if !self.grid.remove(id) {
            error!(entity_id = id, kind = ?entity.kind(), "Entity missing from grid on removal");
        }
        self.by_kind[entity.kind().index()].remove(&id);
        self.dirty.full.remove(&id);
        self.dirty.part.remove(&id);
        self.dirty.deleted.push(id);
        self.pending_release.push(id);
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn ids_of(&self, kind: EntityKind) -> impl Iterator<Item = EntityId> + '_ {
        self.by_kind[kind.index()].iter().copied()
    }

    pub fn count_of(&self, kind: EntityKind) -> usize {
        self.by_kind[kind.index()].len()
    }

    pub fn iter_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> + '_ {
        self.by_kind[kind.index()]
            .iter()
            .filter_map(move |id| self.entities.get(id))
    }

    /// Re-read an entity's bounds into the grid after it moved or changed shape
    pub fn refresh(&mut self, id: EntityId) {
        let Some(entity) = self.entities.get(&id) else {
            error!(entity_id = id, "Refresh of unknown entity");
            return;
        };
        if !self.grid.update(id, entity.bounds()) {
            error!(entity_id = id, "Entity missing from grid on refresh");
        }
    }

    /// Entities whose grid cells overlap `aabb`
    pub fn query(&self, aabb: &Aabb) -> impl Iterator<Item = &Entity> + '_ {
        self.grid
            .query_rect(aabb)
            .into_iter()
            .filter_map(move |id| self.entities.get(&id))
    }

    pub fn mark_full_dirty(&mut self, id: EntityId) {
        self.dirty.full.insert(id);
    }

    pub fn mark_part_dirty(&mut self, id: EntityId) {
        self.dirty.part.insert(id);
    }

    /// Hand the accumulated changes to the net sync and release deleted ids
    pub fn take_dirty(&mut self) -> DirtyFrame {
        for id in self.pending_release.drain(..) {
            self.ids.release(id);
        }
        std::mem::take(&mut self.dirty)
    }
}
