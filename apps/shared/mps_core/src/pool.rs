//! Per-kind entity pool
//!
//! A pool owns the live records of one [`EntityKind`] plus three indexes
//! (local id → slot, handle → local id, remote id → local id). Only `insert`
//! and `remove` touch membership, and they update every index before
//! returning, so accessors never observe a half-removed record.
//!
//! Iteration always runs over a snapshot taken when the call starts and the
//! internal borrow is released before the first callback, so callbacks may
//! create or destroy entities of the same pool. Entities destroyed by a
//! callback are skipped for the rest of that iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::rc::Rc;

use mps_protocol::{EntityKind, Vector3};
use tracing::trace;

use crate::config::PoolConfig;
use crate::entity::{Entity, LocalId, NativeHandle, RemoteId};
use crate::error::{CoreError, Result};
use crate::spatial::SpatialIndex;

/// Anything `exists` can be asked about
#[derive(Debug, Clone, Copy)]
pub enum EntityLookup<'a> {
    Entity(&'a Entity),
    Local(LocalId),
    Handle(NativeHandle),
    Remote(RemoteId),
}

impl<'a> From<&'a Entity> for EntityLookup<'a> {
    fn from(entity: &'a Entity) -> Self {
        EntityLookup::Entity(entity)
    }
}

impl<'a> From<&'a Rc<Entity>> for EntityLookup<'a> {
    fn from(entity: &'a Rc<Entity>) -> Self {
        EntityLookup::Entity(entity)
    }
}

impl From<LocalId> for EntityLookup<'_> {
    fn from(id: LocalId) -> Self {
        EntityLookup::Local(id)
    }
}

impl From<NativeHandle> for EntityLookup<'_> {
    fn from(handle: NativeHandle) -> Self {
        EntityLookup::Handle(handle)
    }
}

impl From<RemoteId> for EntityLookup<'_> {
    fn from(id: RemoteId) -> Self {
        EntityLookup::Remote(id)
    }
}

struct PoolState {
    entities: Vec<Rc<Entity>>,
    by_local: HashMap<LocalId, usize>,
    by_handle: HashMap<NativeHandle, LocalId>,
    by_remote: HashMap<RemoteId, LocalId>,
    /// Bumped on insert/remove
    membership_epoch: u64,
    /// Bumped on insert/remove and on position changes
    spatial_epoch: u64,
}

impl PoolState {
    fn slot_of(&self, entity: &Entity) -> Option<usize> {
        self.by_local
            .get(&entity.local_id())
            .copied()
            .filter(|&slot| ptr::eq(self.entities[slot].as_ref(), entity))
    }

    fn lookup(&self, local_id: LocalId) -> Option<Rc<Entity>> {
        self.by_local
            .get(&local_id)
            .map(|&slot| Rc::clone(&self.entities[slot]))
    }
}

/// Cached result of `to_array_fast`
struct FastArray {
    items: Rc<Vec<Rc<Entity>>>,
    epoch: Option<u64>,
}

pub struct EntityPool {
    kind: EntityKind,
    state: RefCell<PoolState>,
    spatial: RefCell<SpatialIndex>,
    fast: RefCell<FastArray>,
}

impl EntityPool {
    pub fn new(kind: EntityKind, config: &PoolConfig) -> Self {
        Self {
            kind,
            state: RefCell::new(PoolState {
                entities: Vec::new(),
                by_local: HashMap::new(),
                by_handle: HashMap::new(),
                by_remote: HashMap::new(),
                membership_epoch: 0,
                spatial_epoch: 0,
            }),
            spatial: RefCell::new(SpatialIndex::new(config.spatial_cell_size)),
            fast: RefCell::new(FastArray {
                items: Rc::new(Vec::new()),
                epoch: None,
            }),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Number of live records
    pub fn size(&self) -> usize {
        self.state.borrow().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Record at `index`, for `index` in `0..size()`
    pub fn at(&self, index: usize) -> Option<Rc<Entity>> {
        self.state.borrow().entities.get(index).cloned()
    }

    /// Slot currently holding `entity`, if it is a live member
    pub fn index_of(&self, entity: &Entity) -> Option<usize> {
        self.state.borrow().slot_of(entity)
    }

    pub fn at_local_id(&self, local_id: LocalId) -> Option<Rc<Entity>> {
        self.state.borrow().lookup(local_id)
    }

    pub fn at_handle(&self, handle: NativeHandle) -> Option<Rc<Entity>> {
        let state = self.state.borrow();
        let local_id = *state.by_handle.get(&handle)?;
        state.lookup(local_id)
    }

    /// Only synchronized entities carry a remote id
    pub fn at_remote_id(&self, remote_id: RemoteId) -> Option<Rc<Entity>> {
        let state = self.state.borrow();
        let local_id = *state.by_remote.get(&remote_id)?;
        state.lookup(local_id)
    }

    /// Whether the target is a live member; stale references answer false
    pub fn exists<'a>(&self, target: impl Into<EntityLookup<'a>>) -> bool {
        let state = self.state.borrow();
        match target.into() {
            EntityLookup::Entity(entity) => {
                entity.is_alive() && entity.kind() == self.kind && state.slot_of(entity).is_some()
            }
            EntityLookup::Local(local_id) => state.by_local.contains_key(&local_id),
            EntityLookup::Handle(handle) => state.by_handle.contains_key(&handle),
            EntityLookup::Remote(remote_id) => state.by_remote.contains_key(&remote_id),
        }
    }

    pub fn for_each(&self, f: impl FnMut(&Rc<Entity>)) {
        let snapshot = self.to_array();
        Self::visit(snapshot, f);
    }

    pub fn for_each_in_range(&self, position: Vector3, radius: f32, f: impl FnMut(&Rc<Entity>)) {
        let snapshot = self.with_spatial(|index| index.in_range(position, radius));
        Self::visit(snapshot, f);
    }

    pub fn for_each_in_dimension(
        &self,
        position: Vector3,
        radius: f32,
        dimension: i32,
        f: impl FnMut(&Rc<Entity>),
    ) {
        let snapshot = self.with_spatial(|index| index.in_dimension(position, radius, dimension));
        Self::visit(snapshot, f);
    }

    pub fn for_each_in_stream_range(&self, f: impl FnMut(&Rc<Entity>)) {
        let snapshot = SpatialIndex::in_stream_range(&self.state.borrow().entities);
        Self::visit(snapshot, f);
    }

    /// Closest entity to `position`; ties go to the lower local id
    pub fn get_closest(&self, position: Vector3) -> Option<Rc<Entity>> {
        self.get_closest_n(position, 1).into_iter().next()
    }

    /// Up to `limit` entities in non-decreasing distance order
    pub fn get_closest_n(&self, position: Vector3, limit: usize) -> Vec<Rc<Entity>> {
        SpatialIndex::nearest(&self.state.borrow().entities, position, limit)
    }

    /// Like [`EntityPool::get_closest_n`], restricted to one dimension
    pub fn get_closest_in_dimension(
        &self,
        position: Vector3,
        dimension: i32,
        limit: usize,
    ) -> Vec<Rc<Entity>> {
        let candidates: Vec<Rc<Entity>> = self
            .state
            .borrow()
            .entities
            .iter()
            .filter(|entity| entity.dimension() == dimension)
            .cloned()
            .collect();
        SpatialIndex::nearest(&candidates, position, limit)
    }

    /// Fresh copy of the membership
    pub fn to_array(&self) -> Vec<Rc<Entity>> {
        self.state.borrow().entities.clone()
    }

    /// Shared copy of the membership, rebuilt only after membership changed
    ///
    /// The backing vector is reused when the previously returned `Rc` has been
    /// dropped; a caller still holding it keeps a consistent but stale view.
    pub fn to_array_fast(&self) -> Rc<Vec<Rc<Entity>>> {
        let state = self.state.borrow();
        let mut guard = self.fast.borrow_mut();
        let fast = &mut *guard;

        if fast.epoch != Some(state.membership_epoch) {
            if let Some(items) = Rc::get_mut(&mut fast.items) {
                items.clear();
                items.extend(state.entities.iter().cloned());
            } else {
                fast.items = Rc::new(state.entities.clone());
            }
            fast.epoch = Some(state.membership_epoch);
        }

        Rc::clone(&fast.items)
    }

    /// Bind or clear the peer-assigned id of a member
    ///
    /// # Errors
    /// - [`CoreError::StaleEntity`] if `entity` is not a live member
    /// - [`CoreError::DuplicateRemoteId`] if another member already holds the id
    pub fn set_remote_id(&self, entity: &Entity, remote_id: Option<RemoteId>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.slot_of(entity).is_none() {
            return Err(self.stale(entity));
        }

        if let Some(new_id) = remote_id {
            if let Some(&holder) = state.by_remote.get(&new_id) {
                if holder != entity.local_id() {
                    return Err(CoreError::DuplicateRemoteId {
                        kind: self.kind,
                        remote_id: new_id,
                    });
                }
            }
        }

        if let Some(old_id) = entity.remote_id() {
            state.by_remote.remove(&old_id);
        }
        if let Some(new_id) = remote_id {
            state.by_remote.insert(new_id, entity.local_id());
        }
        entity.set_remote_id(remote_id);

        Ok(())
    }

    /// Move a member; returns false for stale references
    pub fn set_position(&self, entity: &Entity, position: Vector3) -> bool {
        let mut state = self.state.borrow_mut();
        if state.slot_of(entity).is_none() {
            return false;
        }
        entity.set_position(position);
        state.spatial_epoch += 1;
        true
    }

    /// Change a member's dimension; returns false for stale references
    pub fn set_dimension(&self, entity: &Entity, dimension: i32) -> bool {
        let state = self.state.borrow();
        if state.slot_of(entity).is_none() {
            return false;
        }
        entity.set_dimension(dimension);
        true
    }

    /// Add a record and index it; marks it alive
    pub(crate) fn insert(&self, entity: Rc<Entity>) -> Result<()> {
        debug_assert_eq!(entity.kind(), self.kind);
        let mut state = self.state.borrow_mut();

        if let Some(&owner) = state.by_handle.get(&entity.handle()) {
            return Err(CoreError::DuplicateHandle {
                handle: entity.handle(),
                kind: self.kind,
                local_id: owner,
            });
        }
        if let Some(remote_id) = entity.remote_id() {
            if state.by_remote.contains_key(&remote_id) {
                return Err(CoreError::DuplicateRemoteId {
                    kind: self.kind,
                    remote_id,
                });
            }
        }

        let slot = state.entities.len();
        state.by_local.insert(entity.local_id(), slot);
        state.by_handle.insert(entity.handle(), entity.local_id());
        if let Some(remote_id) = entity.remote_id() {
            state.by_remote.insert(remote_id, entity.local_id());
        }
        entity.set_alive(true);
        trace!("{} pool: inserted {}", self.kind, entity);
        state.entities.push(entity);
        state.membership_epoch += 1;
        state.spatial_epoch += 1;

        Ok(())
    }

    /// Remove a record from every index at once; marks it dead
    pub(crate) fn remove(&self, local_id: LocalId) -> Option<Rc<Entity>> {
        let mut state = self.state.borrow_mut();
        let slot = state.by_local.remove(&local_id)?;

        let entity = state.entities.swap_remove(slot);
        if slot < state.entities.len() {
            let moved = state.entities[slot].local_id();
            state.by_local.insert(moved, slot);
        }
        state.by_handle.remove(&entity.handle());
        if let Some(remote_id) = entity.remote_id() {
            state.by_remote.remove(&remote_id);
        }
        entity.set_alive(false);
        state.membership_epoch += 1;
        state.spatial_epoch += 1;
        trace!("{} pool: removed {}", self.kind, entity);

        Some(entity)
    }

    /// Remove every record, returning them
    pub(crate) fn clear(&self) -> Vec<Rc<Entity>> {
        let mut state = self.state.borrow_mut();
        let drained: Vec<Rc<Entity>> = state.entities.drain(..).collect();
        state.by_local.clear();
        state.by_handle.clear();
        state.by_remote.clear();
        for entity in &drained {
            entity.set_alive(false);
        }
        state.membership_epoch += 1;
        state.spatial_epoch += 1;
        drained
    }

    fn with_spatial<T>(&self, query: impl FnOnce(&SpatialIndex) -> T) -> T {
        let state = self.state.borrow();
        let mut index = self.spatial.borrow_mut();
        index.rebuild(&state.entities, state.spatial_epoch);
        query(&index)
    }

    fn visit(snapshot: Vec<Rc<Entity>>, mut f: impl FnMut(&Rc<Entity>)) {
        for entity in &snapshot {
            // Destroyed by an earlier callback of this same iteration
            if !entity.is_alive() {
                continue;
            }
            f(entity);
        }
    }

    fn stale(&self, entity: &Entity) -> CoreError {
        CoreError::StaleEntity {
            kind: self.kind,
            local_id: entity.local_id(),
        }
    }
}
