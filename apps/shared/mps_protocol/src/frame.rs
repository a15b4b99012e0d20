use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Delivery class requested for an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reliability {
    /// Delivered in send order, or the connection drops
    Reliable,
    /// May be lost silently; no ordering relative to other frames
    Unreliable,
}

/// Discriminant of a [`Frame`], for logging and routing tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Event,
    Call,
    RpcRequest,
    RpcResponse,
}

/// Messages exchanged between the client bridge and the remote peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Engine or server raised event, dispatched to local handlers
    Event {
        name: String,
        args: Vec<Value>,
    },

    /// Named one-way call (`callRemote` on the sending side)
    Call {
        name: String,
        args: Vec<Value>,
    },

    /// Procedure invocation that expects exactly one matching response
    RpcRequest {
        correlation_id: u64,
        name: String,
        args: Vec<Value>,
    },

    /// Outcome of a procedure; `Err` carries the remote handler's error detail
    RpcResponse {
        correlation_id: u64,
        name: String,
        outcome: Result<Value, String>,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Event { .. } => FrameKind::Event,
            Frame::Call { .. } => FrameKind::Call,
            Frame::RpcRequest { .. } => FrameKind::RpcRequest,
            Frame::RpcResponse { .. } => FrameKind::RpcResponse,
        }
    }

    /// Event or procedure name
    pub fn name(&self) -> &str {
        match self {
            Frame::Event { name, .. }
            | Frame::Call { name, .. }
            | Frame::RpcRequest { name, .. }
            | Frame::RpcResponse { name, .. } => name,
        }
    }

    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Frame::RpcRequest { correlation_id, .. } | Frame::RpcResponse { correlation_id, .. } => {
                Some(*correlation_id)
            }
            _ => None,
        }
    }

    /// Serialize frame to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes using bincode
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let request = Frame::RpcRequest {
            correlation_id: 9,
            name: "sum".to_string(),
            args: vec![Value::Int(1), Value::Int(2)],
        };
        assert_eq!(request.kind(), FrameKind::RpcRequest);
        assert_eq!(request.name(), "sum");
        assert_eq!(request.correlation_id(), Some(9));

        let event = Frame::Event {
            name: "playerReady".to_string(),
            args: vec![],
        };
        assert_eq!(event.correlation_id(), None);
    }

    #[test]
    fn test_error_outcome_survives_encoding() {
        let response = Frame::RpcResponse {
            correlation_id: 3,
            name: "echo".to_string(),
            outcome: Err("handler failed".to_string()),
        };
        let bytes = response.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), response);
    }
}
