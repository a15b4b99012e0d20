//! One pool per entity kind, plus the engine-facing lifecycle
//!
//! The registry is the only place that allocates local ids or touches the
//! handle registry. Script-initiated construction goes through
//! [`PoolRegistry::create`]; engine-initiated lifetime changes arrive as
//! [`EngineNotification`]s.

use std::cell::RefCell;
use std::rc::Rc;

use mps_protocol::{EntityKind, EntityRef, Vector3};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::entity::{Entity, EntitySpawn, LocalId, NativeHandle, RemoteId};
use crate::error::Result;
use crate::handle_registry::HandleRegistry;
use crate::native::{NativeCall, NativeDispatch, handle_from_value};
use crate::pool::EntityPool;

/// Engine-reported change to an object's lifetime or state
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotification {
    /// Object created by the engine on behalf of the peer
    EntityCreated {
        kind: EntityKind,
        handle: NativeHandle,
        remote_id: Option<RemoteId>,
        position: Vector3,
        dimension: i32,
    },
    /// Object entered the local simulation range
    EntityStreamIn {
        kind: EntityKind,
        handle: NativeHandle,
        remote_id: Option<RemoteId>,
        position: Vector3,
        dimension: i32,
    },
    /// Object left the local simulation range; its handle is no longer valid
    EntityStreamOut { handle: NativeHandle },
    /// Object destroyed by the engine
    EntityDestroyed { handle: NativeHandle },
    /// Another player took over (or released) simulation of the object
    EntityControllerChange {
        handle: NativeHandle,
        controller: Option<RemoteId>,
    },
    /// Authoritative position update
    PositionSync {
        handle: NativeHandle,
        position: Vector3,
        dimension: i32,
    },
}

impl EngineNotification {
    /// Local event raised after the notification was applied
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineNotification::EntityCreated { .. } => "entityCreated",
            EngineNotification::EntityStreamIn { .. } => "entityStreamIn",
            EngineNotification::EntityStreamOut { .. } => "entityStreamOut",
            EngineNotification::EntityDestroyed { .. } => "entityDestroyed",
            EngineNotification::EntityControllerChange { .. } => "entityControllerChange",
            EngineNotification::PositionSync { .. } => "entityPositionSync",
        }
    }
}

pub struct PoolRegistry {
    /// Indexed by [`EntityKind::index`]
    pools: Vec<Rc<EntityPool>>,
    handles: RefCell<HandleRegistry>,
    natives: Rc<dyn NativeDispatch>,
}

impl PoolRegistry {
    pub fn new(natives: Rc<dyn NativeDispatch>, config: &PoolConfig) -> Self {
        let pools = EntityKind::ALL
            .iter()
            .map(|&kind| Rc::new(EntityPool::new(kind, config)))
            .collect();
        Self {
            pools,
            handles: RefCell::new(HandleRegistry::new()),
            natives,
        }
    }

    pub fn pool(&self, kind: EntityKind) -> &Rc<EntityPool> {
        &self.pools[kind.index()]
    }

    pub fn peds(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Ped)
    }

    pub fn vehicles(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Vehicle)
    }

    pub fn objects(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Object)
    }

    pub fn blips(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Blip)
    }

    pub fn pickups(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Pickup)
    }

    pub fn checkpoints(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Checkpoint)
    }

    pub fn colshapes(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Colshape)
    }

    pub fn markers(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Marker)
    }

    pub fn labels(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Label)
    }

    pub fn cameras(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Camera)
    }

    pub fn browsers(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Browser)
    }

    pub fn dummies(&self) -> &Rc<EntityPool> {
        self.pool(EntityKind::Dummy)
    }

    pub fn natives(&self) -> &Rc<dyn NativeDispatch> {
        &self.natives
    }

    /// Live records across every pool
    pub fn total_count(&self) -> usize {
        self.pools.iter().map(|pool| pool.size()).sum()
    }

    /// Construct an engine object and track it
    ///
    /// # Errors
    /// - [`crate::CoreError::Native`] if the engine refuses or answers with something other than a handle
    /// - [`crate::CoreError::DuplicateHandle`] if the engine hands out a handle that is still live
    pub fn create(&self, kind: EntityKind, spawn: EntitySpawn) -> Result<Rc<Entity>> {
        let call = NativeCall::create_entity(kind, &spawn);
        let op = call.op;
        let value = self.natives.invoke(call)?;
        let handle = handle_from_value(op, &value)?;

        let entity = self.adopt(kind, handle, None, spawn.position, spawn.dimension)?;
        entity.set_streamed(true);
        Ok(entity)
    }

    /// Destroy an engine object and drop its record
    ///
    /// Returns `Ok(false)` for references that are already stale. If the
    /// engine call fails the record stays in its pool.
    pub fn destroy(&self, entity: &Entity) -> Result<bool> {
        if !self.pool(entity.kind()).exists(entity) {
            return Ok(false);
        }

        self.natives.invoke(NativeCall::destroy_entity(entity.handle()))?;
        Ok(self.forget(entity.handle()).is_some())
    }

    pub fn resolve_handle(&self, handle: NativeHandle) -> Option<Rc<Entity>> {
        let (kind, local_id) = self.handles.borrow().resolve(handle)?;
        self.pool(kind).at_local_id(local_id)
    }

    /// Record referenced by an event argument
    pub fn resolve_ref(&self, entity: EntityRef) -> Option<Rc<Entity>> {
        self.pool(entity.kind).at_local_id(LocalId(entity.id))
    }

    /// Bind or clear the peer-assigned id of a live record
    pub fn bind_remote_id(&self, entity: &Entity, remote_id: Option<RemoteId>) -> Result<()> {
        self.pool(entity.kind()).set_remote_id(entity, remote_id)
    }

    /// Bring the pools in line with an engine notification
    ///
    /// Returns the affected record (already dead for stream-out and destroy),
    /// or `None` when the notification named a handle nobody tracks.
    pub fn apply_notification(&self, notification: &EngineNotification) -> Result<Option<Rc<Entity>>> {
        match *notification {
            EngineNotification::EntityCreated {
                kind,
                handle,
                remote_id,
                position,
                dimension,
            } => self.adopt(kind, handle, remote_id, position, dimension).map(Some),

            EngineNotification::EntityStreamIn {
                kind,
                handle,
                remote_id,
                position,
                dimension,
            } => {
                let entity = match self.resolve_handle(handle) {
                    Some(known) if known.kind() == kind => {
                        let pool = self.pool(kind);
                        // A refused id leaves the record untouched
                        if remote_id.is_some() && known.remote_id() != remote_id {
                            pool.set_remote_id(&known, remote_id)?;
                        }
                        pool.set_position(&known, position);
                        pool.set_dimension(&known, dimension);
                        known
                    }
                    _ => self.adopt(kind, handle, remote_id, position, dimension)?,
                };
                entity.set_streamed(true);
                Ok(Some(entity))
            }

            EngineNotification::EntityStreamOut { handle }
            | EngineNotification::EntityDestroyed { handle } => Ok(self.forget(handle)),

            EngineNotification::EntityControllerChange { handle, controller } => {
                let Some(entity) = self.resolve_handle(handle) else {
                    trace!("Controller change for untracked handle {}", handle);
                    return Ok(None);
                };
                entity.set_controller(controller);
                Ok(Some(entity))
            }

            EngineNotification::PositionSync {
                handle,
                position,
                dimension,
            } => {
                let Some(entity) = self.resolve_handle(handle) else {
                    trace!("Position sync for untracked handle {}", handle);
                    return Ok(None);
                };
                let pool = self.pool(entity.kind());
                pool.set_position(&entity, position);
                pool.set_dimension(&entity, dimension);
                Ok(Some(entity))
            }
        }
    }

    /// Drop every record without calling the engine (session teardown)
    pub fn clear(&self) -> usize {
        self.handles.borrow_mut().clear();
        let removed: usize = self.pools.iter().map(|pool| pool.clear().len()).sum();
        if removed > 0 {
            debug!("Cleared {} tracked entities", removed);
        }
        removed
    }

    fn adopt(
        &self,
        kind: EntityKind,
        handle: NativeHandle,
        remote_id: Option<RemoteId>,
        position: Vector3,
        dimension: i32,
    ) -> Result<Rc<Entity>> {
        let local_id = self.handles.borrow_mut().register(handle, kind)?;
        let entity = Rc::new(Entity::new(local_id, kind, handle, remote_id, position, dimension));

        if let Err(err) = self.pool(kind).insert(Rc::clone(&entity)) {
            warn!("Could not track {}: {}", entity, err);
            self.handles.borrow_mut().unregister(handle);
            return Err(err);
        }

        debug!("Tracking {}", entity);
        Ok(entity)
    }

    fn forget(&self, handle: NativeHandle) -> Option<Rc<Entity>> {
        let (kind, local_id) = self.handles.borrow_mut().unregister(handle)?;
        let removed = self.pool(kind).remove(local_id);
        if let Some(entity) = &removed {
            debug!("Released {}", entity);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::native::{NativeError, NativeOp};
    use crate::test_support::RecordingDispatch;

    fn registry() -> (PoolRegistry, Rc<RecordingDispatch>) {
        let natives = Rc::new(RecordingDispatch::default());
        let registry = PoolRegistry::new(natives.clone(), &PoolConfig::default());
        (registry, natives)
    }

    fn stream_in(kind: EntityKind, handle: u32, remote: Option<u32>) -> EngineNotification {
        EngineNotification::EntityStreamIn {
            kind,
            handle: NativeHandle(handle),
            remote_id: remote.map(RemoteId),
            position: Vector3::new(1.0, 2.0, 3.0),
            dimension: 0,
        }
    }

    #[test]
    fn test_create_and_destroy_through_natives() {
        let (registry, natives) = registry();
        let car = registry
            .create(EntityKind::Vehicle, EntitySpawn::at(Vector3::new(5.0, 0.0, 0.0)))
            .unwrap();

        assert!(car.is_alive());
        assert!(car.is_streamed());
        assert_eq!(registry.vehicles().size(), 1);
        assert!(Rc::ptr_eq(&registry.resolve_handle(car.handle()).unwrap(), &car));

        assert!(registry.destroy(&car).unwrap());
        assert!(!registry.destroy(&car).unwrap());
        assert!(!car.is_alive());
        assert!(registry.resolve_handle(car.handle()).is_none());

        let ops: Vec<NativeOp> = natives.calls().iter().map(|call| call.op).collect();
        assert_eq!(
            ops,
            vec![
                NativeOp::CreateEntity(EntityKind::Vehicle),
                NativeOp::DestroyEntity(car.handle())
            ]
        );
    }

    #[test]
    fn test_failed_construction_tracks_nothing() {
        let (registry, natives) = registry();
        natives.fail_next();

        let err = registry
            .create(EntityKind::Ped, EntitySpawn::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::Native(NativeError::Failed { .. })));
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_failed_destroy_keeps_record() {
        let (registry, natives) = registry();
        let blip = registry.create(EntityKind::Blip, EntitySpawn::default()).unwrap();

        natives.fail_next();
        assert!(registry.destroy(&blip).is_err());
        assert!(blip.is_alive());
        assert!(registry.blips().exists(&blip));
    }

    #[test]
    fn test_duplicate_handle_across_pools() {
        let (registry, _) = registry();
        registry
            .apply_notification(&stream_in(EntityKind::Ped, 7, None))
            .unwrap();

        let err = registry
            .apply_notification(&stream_in(EntityKind::Vehicle, 7, None))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateHandle { .. }));
        assert_eq!(registry.vehicles().size(), 0);
        assert_eq!(registry.peds().size(), 1);
    }

    #[test]
    fn test_stream_out_then_reused_handle_gets_fresh_identity() {
        let (registry, _) = registry();
        let first = registry
            .apply_notification(&stream_in(EntityKind::Object, 42, Some(9)))
            .unwrap()
            .unwrap();

        let out = EngineNotification::EntityStreamOut {
            handle: NativeHandle(42),
        };
        let removed = registry.apply_notification(&out).unwrap().unwrap();
        assert!(Rc::ptr_eq(&removed, &first));
        assert!(!first.is_alive());
        // Reported twice by the engine
        assert!(registry.apply_notification(&out).unwrap().is_none());

        let second = registry
            .apply_notification(&stream_in(EntityKind::Object, 42, Some(9)))
            .unwrap()
            .unwrap();
        assert_ne!(first.local_id(), second.local_id());
        assert!(!registry.objects().exists(&first));
        assert!(registry.objects().exists(&second));
    }

    #[test]
    fn test_stream_in_of_known_handle_updates_record() {
        let (registry, _) = registry();
        let created = registry
            .apply_notification(&EngineNotification::EntityCreated {
                kind: EntityKind::Ped,
                handle: NativeHandle(3),
                remote_id: None,
                position: Vector3::ZERO,
                dimension: 0,
            })
            .unwrap()
            .unwrap();
        assert!(!created.is_streamed());

        let streamed = registry
            .apply_notification(&stream_in(EntityKind::Ped, 3, Some(30)))
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&created, &streamed));
        assert!(created.is_streamed());
        assert_eq!(created.position(), Vector3::new(1.0, 2.0, 3.0));
        assert!(registry.peds().at_remote_id(RemoteId(30)).is_some());
        assert_eq!(registry.peds().size(), 1);
    }

    #[test]
    fn test_stream_in_with_taken_remote_id_changes_nothing() {
        let (registry, _) = registry();
        registry
            .apply_notification(&stream_in(EntityKind::Ped, 1, Some(10)))
            .unwrap();
        let second = registry
            .apply_notification(&stream_in(EntityKind::Ped, 2, Some(20)))
            .unwrap()
            .unwrap();

        let err = registry
            .apply_notification(&EngineNotification::EntityStreamIn {
                kind: EntityKind::Ped,
                handle: NativeHandle(2),
                remote_id: Some(RemoteId(10)),
                position: Vector3::new(999.0, 0.0, 0.0),
                dimension: 4,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRemoteId { .. }));
        assert_eq!(second.position(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(second.dimension(), 0);
        assert_eq!(second.remote_id(), Some(RemoteId(20)));
        assert!(registry.peds().at_remote_id(RemoteId(10)).is_some_and(|ped| ped.handle() == NativeHandle(1)));
    }

    #[test]
    fn test_create_refuses_handle_already_tracked() {
        let (registry, natives) = registry();
        registry
            .apply_notification(&stream_in(EntityKind::Object, 0x200, None))
            .unwrap();

        natives.set_next_handle(0x200);
        let err = registry
            .create(EntityKind::Vehicle, EntitySpawn::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateHandle { .. }));
        assert_eq!(registry.vehicles().size(), 0);
        assert_eq!(registry.objects().size(), 1);
    }

    #[test]
    fn test_controller_and_position_updates() {
        let (registry, _) = registry();
        let ped = registry
            .apply_notification(&stream_in(EntityKind::Ped, 5, Some(1)))
            .unwrap()
            .unwrap();

        registry
            .apply_notification(&EngineNotification::EntityControllerChange {
                handle: NativeHandle(5),
                controller: Some(RemoteId(77)),
            })
            .unwrap();
        assert_eq!(ped.controller(), Some(RemoteId(77)));

        registry
            .apply_notification(&EngineNotification::PositionSync {
                handle: NativeHandle(5),
                position: Vector3::new(100.0, 0.0, 0.0),
                dimension: 2,
            })
            .unwrap();
        assert_eq!(ped.position(), Vector3::new(100.0, 0.0, 0.0));
        assert_eq!(ped.dimension(), 2);

        let unknown = EngineNotification::EntityControllerChange {
            handle: NativeHandle(999),
            controller: None,
        };
        assert!(registry.apply_notification(&unknown).unwrap().is_none());
    }

    #[test]
    fn test_resolve_ref_and_clear() {
        let (registry, _) = registry();
        let marker = registry.create(EntityKind::Marker, EntitySpawn::default()).unwrap();
        registry.create(EntityKind::Label, EntitySpawn::default()).unwrap();

        let found = registry.resolve_ref(marker.entity_ref()).unwrap();
        assert!(Rc::ptr_eq(&found, &marker));

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.total_count(), 0);
        assert!(!marker.is_alive());
        assert!(registry.resolve_handle(marker.handle()).is_none());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            stream_in(EntityKind::Ped, 1, None).event_name(),
            "entityStreamIn"
        );
        assert_eq!(
            EngineNotification::EntityStreamOut {
                handle: NativeHandle(1)
            }
            .event_name(),
            "entityStreamOut"
        );
    }
}
