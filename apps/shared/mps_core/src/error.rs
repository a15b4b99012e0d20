use mps_protocol::{EntityKind, ProtocolError};
use thiserror::Error;

use crate::entity::{LocalId, NativeHandle, RemoteId};
use crate::native::NativeError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Handle {handle} is already registered to {kind}#{local_id}")]
    DuplicateHandle {
        handle: NativeHandle,
        kind: EntityKind,
        local_id: LocalId,
    },

    #[error("Remote id {remote_id} is already bound in the {kind} pool")]
    DuplicateRemoteId { kind: EntityKind, remote_id: RemoteId },

    #[error("Entity {kind}#{local_id} is not live in its pool")]
    StaleEntity { kind: EntityKind, local_id: LocalId },

    #[error("Native call failed: {0}")]
    Native(#[from] NativeError),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
