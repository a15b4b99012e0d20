//! Single dispatcher for everything arriving from outside the script
//!
//! Inbound frames and engine notifications are queued on one channel and
//! handled in arrival order by [`Bridge::run`]. Procedure requests are served
//! on their own local task, so a procedure that awaits a remote call of its own
//! does not hold up the frames behind it.

use std::rc::Rc;

use mps_protocol::{Frame, Reliability, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::events::EventBus;
use crate::pool_registry::{EngineNotification, PoolRegistry};
use crate::rpc::RpcClient;
use crate::transport::Transport;

/// Local event raised once the connection is gone
pub const DISCONNECTED_EVENT: &str = "disconnected";

/// Messages consumed by the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    Engine(EngineNotification),
    /// The connection to the peer ended
    Disconnected,
}

pub struct Bridge {
    pools: Rc<PoolRegistry>,
    events: Rc<EventBus>,
    rpc: RpcClient,
    transport: Rc<dyn Transport>,
}

impl Bridge {
    pub fn new(
        pools: Rc<PoolRegistry>,
        events: Rc<EventBus>,
        rpc: RpcClient,
        transport: Rc<dyn Transport>,
    ) -> Self {
        Self {
            pools,
            events,
            rpc,
            transport,
        }
    }

    pub fn pools(&self) -> &Rc<PoolRegistry> {
        &self.pools
    }

    pub fn events(&self) -> &Rc<EventBus> {
        &self.events
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Process inbound messages until the channel closes or the peer disconnects
    ///
    /// Must run inside a `LocalSet`. On exit every pending call is rejected
    /// and the `disconnected` local event is raised.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(message) = inbound.recv().await {
            if !self.handle(message) {
                break;
            }
        }

        self.rpc.disconnect();
        self.events.call(DISCONNECTED_EVENT, &[]);
        debug!("Bridge stopped");
    }

    /// Route one message; false once the peer is gone
    pub fn handle(&self, message: Inbound) -> bool {
        match message {
            Inbound::Frame(frame) => self.handle_frame(frame),
            Inbound::Engine(notification) => self.handle_notification(&notification),
            Inbound::Disconnected => return false,
        }
        true
    }

    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Event { name, args } | Frame::Call { name, args } => {
                self.events.call(&name, &args);
            }
            Frame::RpcRequest {
                correlation_id,
                name,
                args,
            } => self.serve_request(correlation_id, name, args),
            Frame::RpcResponse {
                correlation_id,
                outcome,
                ..
            } => {
                self.rpc.resolve(correlation_id, outcome);
            }
        }
    }

    /// Apply an engine notification, then tell local handlers about it
    pub fn handle_notification(&self, notification: &EngineNotification) {
        let entity = match self.pools.apply_notification(notification) {
            Ok(Some(entity)) => entity,
            Ok(None) => return,
            Err(err) => {
                error!("Could not apply {}: {}", notification.event_name(), err);
                return;
            }
        };

        let mut args = vec![Value::Entity(entity.entity_ref())];
        if let EngineNotification::EntityControllerChange { controller, .. } = notification {
            args.push(controller.map_or(Value::Null, |id| Value::from(id.0)));
        }
        self.events.call(notification.event_name(), &args);
    }

    fn serve_request(&self, correlation_id: u64, name: String, args: Vec<Value>) {
        let Some(handler) = self.events.proc_handler(&name) else {
            warn!(proc = %name, "Request #{} for unknown procedure", correlation_id);
            let outcome = Err(format!("Unknown procedure '{}'", name));
            reply(self.transport.as_ref(), correlation_id, name, outcome);
            return;
        };

        trace!(proc = %name, "Serving request #{}", correlation_id);
        let pending = handler(args);
        let transport = Rc::clone(&self.transport);
        tokio::task::spawn_local(async move {
            let outcome = pending.await;
            if let Err(message) = &outcome {
                debug!(proc = %name, "Procedure failed: {}", message);
            }
            reply(transport.as_ref(), correlation_id, name, outcome);
        });
    }
}

fn reply(transport: &dyn Transport, correlation_id: u64, name: String, outcome: Result<Value, String>) {
    let frame = Frame::RpcResponse {
        correlation_id,
        name,
        outcome,
    };
    if let Err(err) = transport.send(frame, Reliability::Reliable) {
        warn!("Response #{} not sent: {}", correlation_id, err);
    }
}
