//! Recording doubles for the core's seams

use std::cell::{Cell, RefCell};

use mps_protocol::{Frame, Reliability, Value};

use crate::error::{CoreError, Result};
use crate::events::{DiagnosticSink, HandlerError, HandlerId};
use crate::native::{NativeCall, NativeDispatch, NativeError, NativeOp};
use crate::transport::Transport;

/// Engine stand-in: hands out sequential handles and records every call
pub struct RecordingDispatch {
    calls: RefCell<Vec<NativeCall>>,
    next_handle: Cell<u32>,
    fail_next: Cell<bool>,
}

impl Default for RecordingDispatch {
    fn default() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            next_handle: Cell::new(0x100),
            fail_next: Cell::new(false),
        }
    }
}

impl RecordingDispatch {
    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.borrow().clone()
    }

    /// Make the next call fail with an engine error
    pub fn fail_next(&self) {
        self.fail_next.set(true);
    }

    /// Force the handle the next construction returns
    pub fn set_next_handle(&self, handle: u32) {
        self.next_handle.set(handle);
    }
}

impl NativeDispatch for RecordingDispatch {
    fn invoke(&self, call: NativeCall) -> std::result::Result<Value, NativeError> {
        let op = call.op;
        self.calls.borrow_mut().push(call);

        if self.fail_next.replace(false) {
            return Err(NativeError::Failed {
                op: op.to_string(),
                message: "engine refused".to_string(),
            });
        }

        match op {
            NativeOp::CreateEntity(_) => {
                let handle = self.next_handle.get();
                self.next_handle.set(handle + 1);
                Ok(Value::Int(handle as i64))
            }
            NativeOp::DestroyEntity(_) | NativeOp::Invoke(_) => Ok(Value::Null),
        }
    }
}

/// Transport stand-in capturing outbound frames
#[derive(Default)]
pub struct RecordingTransport {
    sent: RefCell<Vec<(Frame, Reliability)>>,
    closed: Cell<bool>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Frame, Reliability)> {
        self.sent.borrow().clone()
    }

    /// Drain captured frames
    pub fn take(&self) -> Vec<Frame> {
        self.sent.borrow_mut().drain(..).map(|(frame, _)| frame).collect()
    }

    pub fn close(&self) {
        self.closed.set(true);
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: Frame, reliability: Reliability) -> Result<()> {
        if self.closed.get() {
            return Err(CoreError::TransportClosed);
        }
        self.sent.borrow_mut().push((frame, reliability));
        Ok(())
    }
}

/// Diagnostic sink keeping `(event, handler, message)` triples
#[derive(Default)]
pub struct CollectingSink {
    failures: RefCell<Vec<(String, HandlerId, String)>>,
}

impl CollectingSink {
    pub fn failures(&self) -> Vec<(String, HandlerId, String)> {
        self.failures.borrow().clone()
    }
}

impl DiagnosticSink for CollectingSink {
    fn handler_failed(&self, event: &str, handler: HandlerId, error: &HandlerError) {
        self.failures
            .borrow_mut()
            .push((event.to_string(), handler, error.message.clone()));
    }
}
