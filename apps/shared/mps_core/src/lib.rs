//! Client scripting core for the multiplayer mod platform
//!
//! Provides the two stateful abstractions behind the client scripting
//! surface. Everything else a script can call is a flat pass-through to engine
//! natives and goes through [`NativeDispatch`] untouched.
//!
//! # Architecture
//!
//! - **HandleRegistry**: native handle to `(kind, local id)` mapping
//! - **EntityPool**: per-kind records with handle / remote id indexes and snapshot iteration
//! - **SpatialIndex**: nearest, in-range, in-dimension and in-stream-range queries
//! - **PoolRegistry**: one pool per kind, creation/destruction and engine notifications
//! - **EventBus**: local pub/sub, fire-and-forget remote calls, procedure registry
//! - **RpcClient**: correlated remote procedure calls with cancellation and timeouts
//! - **Bridge**: routes inbound frames and engine notifications to the above
//!
//! All state is single-threaded (`Rc`/`RefCell`). Hosts drive the bridge from a
//! current-thread tokio runtime inside a `LocalSet`.

pub mod bridge;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod handle_registry;
pub mod native;
pub mod pool;
pub mod pool_registry;
pub mod rpc;
pub mod session;
pub mod spatial;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use bridge::{Bridge, DISCONNECTED_EVENT, Inbound};
pub use config::{FrameLimit, CoreConfig, PoolConfig, RpcConfig, SessionConfig};
pub use entity::{Entity, EntitySpawn, LocalId, NativeHandle, RemoteId};
pub use error::{CoreError, Result};
pub use events::{
    DiagnosticSink, EventBus, EventHandler, HandlerAction, HandlerError, HandlerId, ProcFuture,
    ProcHandler, TracingSink,
};
pub use handle_registry::HandleRegistry;
pub use native::{NativeCall, NativeDispatch, NativeError, NativeOp};
pub use pool::{EntityLookup, EntityPool};
pub use pool_registry::{EngineNotification, PoolRegistry};
pub use rpc::{CallOptions, PendingCallInfo, RpcCall, RpcClient, RpcError, RpcState};
pub use session::Session;
pub use spatial::SpatialIndex;
pub use transport::{ChannelTransport, OutboundQueues, Transport};

pub use mps_protocol::{EntityKind, EntityRef, Frame, Reliability, Value, Vector3};
