//! Command implementations for the headless client
//!
//! Each command connects, wires the scripting core onto the session and
//! drives it from the current `LocalSet`.

use std::rc::Rc;

use mps_core::{
    Bridge, CoreError, DISCONNECTED_EVENT, EntityKind, EntityRef, EventBus, HandlerAction, Inbound,
    PoolRegistry, RpcClient, RpcError, Session, Transport, Value, Vector3,
};
use serde_json::{Map, Number, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::natives::HeadlessNatives;

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Connection failed: {0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Rpc(#[from] RpcError),

    #[error("Failed to install Ctrl+C handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Entity events logged by `listen`
const ENTITY_EVENTS: [&str; 6] = [
    "entityCreated",
    "entityStreamIn",
    "entityStreamOut",
    "entityDestroyed",
    "entityControllerChange",
    "entityPositionSync",
];

/// A connected session with the scripting core on top of it
pub struct Client {
    session: Session,
    bridge: Rc<Bridge>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let core = config.core();
        let (tx, inbound) = mpsc::unbounded_channel();
        let session = Session::connect(config.server_addr.as_str(), &core.session, tx).await?;

        let transport: Rc<dyn Transport> = session.transport();
        let pools = Rc::new(PoolRegistry::new(Rc::new(HeadlessNatives::new()), &core.pools));
        let events = Rc::new(EventBus::new(Rc::clone(&transport)));
        let rpc = RpcClient::new(Rc::clone(&transport), core.rpc);
        let bridge = Rc::new(Bridge::new(pools, events, rpc, transport));

        Ok(Self {
            session,
            bridge,
            inbound,
        })
    }

    /// Serve the built-in procedures and log traffic until the peer leaves or Ctrl+C
    pub async fn listen(self) -> Result<()> {
        let Client {
            session,
            bridge,
            inbound,
        } = self;
        register_builtin_procs(bridge.events());
        subscribe_logging(bridge.events());

        info!(peer = %session.peer_addr(), "Listening, press Ctrl+C to stop");
        let outcome = tokio::select! {
            _ = bridge.run(inbound) => Ok(()),
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                signal.map_err(CommandError::Signal)
            }
        };

        session.close().await;
        outcome
    }

    /// Call a remote procedure and wait for its result
    pub async fn call(self, name: &str, args: Vec<Value>) -> Result<serde_json::Value> {
        let Client {
            session,
            bridge,
            inbound,
        } = self;

        let runner = Rc::clone(&bridge);
        let dispatcher = tokio::task::spawn_local(async move { runner.run(inbound).await });

        debug!(proc = %name, "Calling with {} arg(s)", args.len());
        let result = bridge.rpc().call_remote_proc(name, args).await;

        session.close().await;
        dispatcher.abort();
        Ok(value_to_json(&result?))
    }

    /// Fire a remote event and flush it before disconnecting
    pub async fn emit(self, name: &str, args: Vec<Value>, unreliable: bool) -> Result<()> {
        let events = self.bridge.events();
        if unreliable {
            events.call_remote_unreliable(name, args)?;
        } else {
            events.call_remote(name, args)?;
        }
        info!(event = %name, "Sent");

        self.session.close().await;
        Ok(())
    }
}

fn register_builtin_procs(events: &EventBus) {
    events.add_proc("ping", |_| async { Ok(Value::from("pong")) });
    events.add_proc("echo", |mut args| async move {
        Ok(match args.len() {
            0 => Value::Null,
            1 => args.remove(0),
            _ => Value::List(args),
        })
    });
}

fn subscribe_logging(events: &EventBus) {
    for name in ENTITY_EVENTS {
        events.add(name, move |args| {
            let described: Vec<String> = args.iter().map(describe).collect();
            debug!(event = %name, "{}", described.join(", "));
            Ok(HandlerAction::Continue)
        });
    }

    events.add(DISCONNECTED_EVENT, |_| {
        warn!("Disconnected from peer");
        Ok(HandlerAction::Unsubscribe)
    });
}

fn describe(value: &Value) -> String {
    match value {
        Value::Entity(entity) => entity.to_string(),
        other => value_to_json(other).to_string(),
    }
}

/// Command line argument as a value; anything that is not JSON is a string
pub fn parse_arg(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => json_to_value(json),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// JSON to script value
///
/// `{"x","y","z"}` objects become vectors and `{"kind","id"}` objects become
/// entity references. Other objects travel as their JSON text.
pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            if let Some(vector) = vector_from_map(&map) {
                Value::Vector3(vector)
            } else if let Some(entity) = entity_from_map(&map) {
                Value::Entity(entity)
            } else {
                Value::String(serde_json::Value::Object(map).to_string())
            }
        }
    }
}

fn vector_from_map(map: &Map<String, serde_json::Value>) -> Option<Vector3> {
    if map.len() != 3 {
        return None;
    }
    let axis = |key: &str| map.get(key).and_then(serde_json::Value::as_f64).map(|v| v as f32);
    Some(Vector3::new(axis("x")?, axis("y")?, axis("z")?))
}

fn entity_from_map(map: &Map<String, serde_json::Value>) -> Option<EntityRef> {
    if map.len() != 2 {
        return None;
    }
    let kind = EntityKind::from_name(map.get("kind")?.as_str()?)?;
    let id = u32::try_from(map.get("id")?.as_u64()?).ok()?;
    Some(EntityRef::new(kind, id))
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => json!(s),
        Value::Vector3(v) => json!({ "x": v.x, "y": v.y, "z": v.z }),
        Value::Entity(e) => json!({ "kind": e.kind.name(), "id": e.id }),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    }
}
