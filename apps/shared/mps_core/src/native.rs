//! Native dispatch seam
//!
//! Engine natives are a black box to the core. Pools call through this trait
//! to construct and destroy engine objects, and hosts route the pass-through
//! script calls the same way.

use std::fmt;

use mps_protocol::{EntityKind, Value};
use thiserror::Error;

use crate::entity::{EntitySpawn, NativeHandle};

/// Operation requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOp {
    /// Construct an engine object; the engine answers with its handle
    CreateEntity(EntityKind),
    /// Release an engine object
    DestroyEntity(NativeHandle),
    /// Any other native, identified by its hash
    Invoke(u64),
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeOp::CreateEntity(kind) => write!(f, "create_{}", kind),
            NativeOp::DestroyEntity(handle) => write!(f, "destroy({})", handle),
            NativeOp::Invoke(hash) => write!(f, "0x{:016X}", hash),
        }
    }
}

/// A native call: opcode plus typed argument vector
#[derive(Debug, Clone, PartialEq)]
pub struct NativeCall {
    pub op: NativeOp,
    pub args: Vec<Value>,
}

impl NativeCall {
    /// Construction call; position and dimension lead the argument list
    pub fn create_entity(kind: EntityKind, spawn: &EntitySpawn) -> Self {
        let mut args = Vec::with_capacity(spawn.args.len() + 2);
        args.push(Value::Vector3(spawn.position));
        args.push(Value::Int(spawn.dimension as i64));
        args.extend(spawn.args.iter().cloned());
        Self {
            op: NativeOp::CreateEntity(kind),
            args,
        }
    }

    pub fn destroy_entity(handle: NativeHandle) -> Self {
        Self {
            op: NativeOp::DestroyEntity(handle),
            args: Vec::new(),
        }
    }

    pub fn invoke(hash: u64, args: Vec<Value>) -> Self {
        Self {
            op: NativeOp::Invoke(hash),
            args,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    #[error("Native {op} failed: {message}")]
    Failed { op: String, message: String },

    #[error("Native {op} returned {got}, expected {expected}")]
    UnexpectedReturn {
        op: String,
        expected: &'static str,
        got: &'static str,
    },
}

/// Engine-side executor of native calls
///
/// Implementations never block; an engine-defined failure is returned as
/// [`NativeError::Failed`].
pub trait NativeDispatch {
    fn invoke(&self, call: NativeCall) -> Result<Value, NativeError>;
}

/// Interpret a construction result as an engine handle
pub(crate) fn handle_from_value(op: NativeOp, value: &Value) -> Result<NativeHandle, NativeError> {
    value
        .as_i64()
        .and_then(|raw| u32::try_from(raw).ok())
        .map(NativeHandle)
        .ok_or_else(|| NativeError::UnexpectedReturn {
            op: op.to_string(),
            expected: "handle",
            got: value.type_name(),
        })
}
