//! Event bus: local pub/sub, one-way remote calls and procedure registry
//!
//! # Architecture
//!
//! - **Subscription**: handlers register under an event name and get a [`HandlerId`].
//!   Several handlers per name are allowed, including the same closure twice.
//! - **Dispatch**: `call` runs handlers synchronously in subscription order over
//!   a snapshot of the list. Handlers added during a dispatch wait for the next
//!   one; handlers removed during a dispatch are skipped.
//! - **Failures**: an `Err` or a panic in one handler does not stop the others.
//!   Errors are reported to the [`DiagnosticSink`] once every handler ran.
//! - **Procedures**: `add_proc` registers the answer to remote procedure calls
//!   arriving from the peer. At most one handler per name.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;

use mps_protocol::{Frame, Reliability, Value};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::transport::Transport;

/// Identifies one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a handler wants done with its own subscription after running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerAction {
    #[default]
    Continue,
    /// Remove this subscription (and only this one)
    Unsubscribe,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl HandlerError {
    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|text| text.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown cause".to_string());
        Self::new(format!("handler panicked: {}", detail))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Local event handler
pub type EventHandler = Rc<dyn Fn(&[Value]) -> std::result::Result<HandlerAction, HandlerError>>;

/// Pending outcome of a procedure; `Err` is sent back to the caller as the remote error
pub type ProcFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>>>>;

/// Procedure handler invoked for inbound remote procedure calls
pub type ProcHandler = Rc<dyn Fn(Vec<Value>) -> ProcFuture>;

/// Receives handler failures collected during a dispatch
pub trait DiagnosticSink {
    fn handler_failed(&self, event: &str, handler: HandlerId, error: &HandlerError);
}

/// Default sink: logs through `tracing`
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn handler_failed(&self, event: &str, handler: HandlerId, error: &HandlerError) {
        error!(event = event, "Handler {} failed: {}", handler, error);
    }
}

#[derive(Clone)]
struct Subscription {
    id: HandlerId,
    handler: EventHandler,
}

pub struct EventBus {
    handlers: RefCell<HashMap<String, Vec<Subscription>>>,
    procs: RefCell<HashMap<String, ProcHandler>>,
    next_handler_id: Cell<u64>,
    transport: Rc<dyn Transport>,
    diagnostics: Rc<dyn DiagnosticSink>,
}

impl EventBus {
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        Self::with_diagnostics(transport, Rc::new(TracingSink))
    }

    pub fn with_diagnostics(transport: Rc<dyn Transport>, diagnostics: Rc<dyn DiagnosticSink>) -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
            procs: RefCell::new(HashMap::new()),
            next_handler_id: Cell::new(1),
            transport,
            diagnostics,
        }
    }

    /// Subscribe a closure to `name`
    pub fn add<F>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&[Value]) -> std::result::Result<HandlerAction, HandlerError> + 'static,
    {
        self.add_handler(name, Rc::new(handler))
    }

    /// Subscribe an already shared handler; the same `Rc` may be added repeatedly
    pub fn add_handler(&self, name: impl Into<String>, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler_id.get());
        self.next_handler_id.set(id.0 + 1);

        let name = name.into();
        trace!(event = %name, "Subscribed handler {}", id);
        self.handlers
            .borrow_mut()
            .entry(name)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Remove one subscription, or every subscription of `name` when `id` is `None`
    ///
    /// Unknown names and ids are ignored. Returns how many were removed.
    pub fn remove(&self, name: &str, id: Option<HandlerId>) -> usize {
        let mut handlers = self.handlers.borrow_mut();
        let Some(list) = handlers.get_mut(name) else {
            return 0;
        };

        let before = list.len();
        match id {
            Some(id) => list.retain(|sub| sub.id != id),
            None => list.clear(),
        }
        let removed = before - list.len();

        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    pub fn has(&self, name: &str) -> bool {
        self.handler_count(name) > 0
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.borrow().get(name).map_or(0, Vec::len)
    }

    /// Dispatch locally; returns the number of handlers invoked
    pub fn call(&self, name: &str, args: &[Value]) -> usize {
        let snapshot: Vec<Subscription> = match self.handlers.borrow().get(name) {
            Some(list) => list.clone(),
            None => {
                trace!(event = name, "No handlers");
                return 0;
            }
        };

        let mut invoked = 0;
        let mut failures = Vec::new();
        for sub in &snapshot {
            if !self.is_subscribed(name, sub.id) {
                continue;
            }
            invoked += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(args)))
                .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload.as_ref())));
            match outcome {
                Ok(HandlerAction::Continue) => {}
                Ok(HandlerAction::Unsubscribe) => {
                    self.remove(name, Some(sub.id));
                }
                Err(err) => failures.push((sub.id, err)),
            }
        }

        for (id, err) in &failures {
            self.diagnostics.handler_failed(name, *id, err);
        }
        trace!(event = name, "Dispatched to {} handler(s)", invoked);
        invoked
    }

    /// Reliable one-way call to the peer
    pub fn call_remote(&self, name: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.send_call(name.into(), args, Reliability::Reliable)
    }

    /// One-way call to the peer that may be lost or reordered
    pub fn call_remote_unreliable(&self, name: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.send_call(name.into(), args, Reliability::Unreliable)
    }

    /// Register the handler answering procedure `name`
    ///
    /// Returns true if an earlier handler was replaced.
    pub fn add_proc<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + 'static,
    {
        let boxed: ProcHandler = Rc::new(move |args: Vec<Value>| -> ProcFuture { Box::pin(handler(args)) });
        self.add_proc_handler(name, boxed)
    }

    pub fn add_proc_handler(&self, name: impl Into<String>, handler: ProcHandler) -> bool {
        let name = name.into();
        let replaced = self.procs.borrow_mut().insert(name.clone(), handler).is_some();
        if replaced {
            warn!(proc = %name, "Replacing previously registered procedure");
        } else {
            debug!(proc = %name, "Procedure registered");
        }
        replaced
    }

    pub fn remove_proc(&self, name: &str) -> bool {
        self.procs.borrow_mut().remove(name).is_some()
    }

    pub fn has_proc(&self, name: &str) -> bool {
        self.procs.borrow().contains_key(name)
    }

    /// Handler for `name`, cloned out so the registry is not borrowed while it runs
    pub fn proc_handler(&self, name: &str) -> Option<ProcHandler> {
        self.procs.borrow().get(name).cloned()
    }

    fn is_subscribed(&self, name: &str, id: HandlerId) -> bool {
        self.handlers
            .borrow()
            .get(name)
            .is_some_and(|list| list.iter().any(|sub| sub.id == id))
    }

    fn send_call(&self, name: String, args: Vec<Value>, reliability: Reliability) -> Result<()> {
        trace!(event = %name, "Sending {:?} call with {} arg(s)", reliability, args.len());
        self.transport.send(Frame::Call { name, args }, reliability)
    }
}
