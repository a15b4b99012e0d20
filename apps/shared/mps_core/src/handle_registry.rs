//! Bidirectional mapping between engine handles and pool identities

use std::collections::HashMap;

use mps_protocol::EntityKind;
use tracing::{error, trace};

use crate::entity::{LocalId, NativeHandle};
use crate::error::{CoreError, Result};

/// Maps live native handles to the `(kind, local id)` pair owning them
///
/// Local ids come from a single monotonic counter, so a handle value that the
/// engine recycles after unregistration always resolves to a fresh id.
pub struct HandleRegistry {
    live: HashMap<NativeHandle, (EntityKind, LocalId)>,
    next_local_id: u32,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            next_local_id: 1,
        }
    }

    /// Register a handle for a new object and allocate its local id
    ///
    /// # Errors
    /// [`CoreError::DuplicateHandle`] if the handle is live for any kind.
    pub fn register(&mut self, handle: NativeHandle, kind: EntityKind) -> Result<LocalId> {
        if let Some(&(owner_kind, owner_id)) = self.live.get(&handle) {
            error!(
                "Refusing to register handle {} as {}: already owned by {}#{}",
                handle, kind, owner_kind, owner_id
            );
            return Err(CoreError::DuplicateHandle {
                handle,
                kind: owner_kind,
                local_id: owner_id,
            });
        }

        let local_id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        self.live.insert(handle, (kind, local_id));
        trace!("Registered handle {} as {}#{}", handle, kind, local_id);

        Ok(local_id)
    }

    pub fn resolve(&self, handle: NativeHandle) -> Option<(EntityKind, LocalId)> {
        self.live.get(&handle).copied()
    }

    /// Forget a handle; unknown handles are ignored (stream-out may be reported twice)
    pub fn unregister(&mut self, handle: NativeHandle) -> Option<(EntityKind, LocalId)> {
        let removed = self.live.remove(&handle);
        if removed.is_none() {
            trace!("Ignoring unregister of unknown handle {}", handle);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drop every live mapping; the id counter keeps running
    pub fn clear(&mut self) {
        self.live.clear();
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
