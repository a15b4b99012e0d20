//! Entity records shared by every pool
//!
//! A record is handed out as `Rc<Entity>`: iteration snapshots and script code
//! may keep a reference after the pool dropped it, in which case
//! [`Entity::is_alive`] turns false in the same step as the removal.

use std::cell::Cell;
use std::fmt;

use mps_protocol::{EntityKind, EntityRef, Value, Vector3};

/// Process-local entity identifier, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Identifier shared with the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(pub u32);

/// Opaque engine handle; the engine may recycle values at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u32);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Parameters for a script-initiated entity construction
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntitySpawn {
    pub position: Vector3,
    pub dimension: i32,
    /// Kind-specific constructor arguments (model hash, colour, text, ...)
    pub args: Vec<Value>,
}

impl EntitySpawn {
    pub fn at(position: Vector3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn with_dimension(mut self, dimension: i32) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Live (or formerly live) game object of one kind
#[derive(Debug)]
pub struct Entity {
    local_id: LocalId,
    kind: EntityKind,
    handle: NativeHandle,
    remote_id: Cell<Option<RemoteId>>,
    position: Cell<Vector3>,
    dimension: Cell<i32>,
    controller: Cell<Option<RemoteId>>,
    streamed: Cell<bool>,
    alive: Cell<bool>,
}

impl Entity {
    pub(crate) fn new(
        local_id: LocalId,
        kind: EntityKind,
        handle: NativeHandle,
        remote_id: Option<RemoteId>,
        position: Vector3,
        dimension: i32,
    ) -> Self {
        Self {
            local_id,
            kind,
            handle,
            remote_id: Cell::new(remote_id),
            position: Cell::new(position),
            dimension: Cell::new(dimension),
            controller: Cell::new(None),
            streamed: Cell::new(false),
            alive: Cell::new(false),
        }
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// `None` until the peer has synchronized this object
    pub fn remote_id(&self) -> Option<RemoteId> {
        self.remote_id.get()
    }

    pub fn position(&self) -> Vector3 {
        self.position.get()
    }

    pub fn dimension(&self) -> i32 {
        self.dimension.get()
    }

    /// Remote player currently simulating this entity
    pub fn controller(&self) -> Option<RemoteId> {
        self.controller.get()
    }

    /// Whether the engine currently streams this entity in
    pub fn is_streamed(&self) -> bool {
        self.streamed.get()
    }

    /// False once the owning pool removed the record
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub fn distance_to(&self, point: Vector3) -> f32 {
        self.position().distance(point)
    }

    /// Reference used in event arguments
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.local_id.0)
    }

    pub(crate) fn set_remote_id(&self, remote_id: Option<RemoteId>) {
        self.remote_id.set(remote_id);
    }

    pub(crate) fn set_position(&self, position: Vector3) {
        self.position.set(position);
    }

    pub(crate) fn set_dimension(&self, dimension: i32) {
        self.dimension.set(dimension);
    }

    pub(crate) fn set_controller(&self, controller: Option<RemoteId>) {
        self.controller.set(controller);
    }

    pub(crate) fn set_streamed(&self, streamed: bool) {
        self.streamed.set(streamed);
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.set(alive);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.kind, self.local_id, self.handle)
    }
}
