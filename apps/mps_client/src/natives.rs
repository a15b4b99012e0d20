//! Engine stand-in for running the core without a game process

use std::cell::Cell;

use mps_core::{NativeCall, NativeDispatch, NativeError, NativeOp, Value};
use tracing::trace;

/// Allocates handles for constructed objects and refuses every other native
pub struct HeadlessNatives {
    next_handle: Cell<u32>,
}

impl HeadlessNatives {
    pub fn new() -> Self {
        Self {
            next_handle: Cell::new(1),
        }
    }
}

impl Default for HeadlessNatives {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDispatch for HeadlessNatives {
    fn invoke(&self, call: NativeCall) -> Result<Value, NativeError> {
        trace!("Native {} with {} arg(s)", call.op, call.args.len());
        match call.op {
            NativeOp::CreateEntity(_) => {
                let handle = self.next_handle.get();
                self.next_handle.set(handle.wrapping_add(1).max(1));
                Ok(Value::from(handle))
            }
            NativeOp::DestroyEntity(_) => Ok(Value::Null),
            NativeOp::Invoke(_) => Err(NativeError::Failed {
                op: call.op.to_string(),
                message: "no engine attached".to_string(),
            }),
        }
    }
}
