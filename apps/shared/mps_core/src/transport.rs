//! Outbound side of the connection to the remote peer

use std::cell::RefCell;

use mps_protocol::{Frame, Reliability};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::error::{CoreError, Result};

/// Sink for outbound frames
///
/// `send` never blocks. Reliable frames keep their send order; unreliable ones
/// may be dropped and carry no ordering guarantee relative to reliable ones.
pub trait Transport {
    fn send(&self, frame: Frame, reliability: Reliability) -> Result<()>;
}

/// Receiving ends drained by the connection writer
pub struct OutboundQueues {
    pub reliable: mpsc::UnboundedReceiver<Frame>,
    pub unreliable: mpsc::Receiver<Frame>,
}

/// Channel-backed transport: one unbounded queue for reliable frames and a
/// bounded one for unreliable frames
pub struct ChannelTransport {
    reliable: RefCell<Option<mpsc::UnboundedSender<Frame>>>,
    unreliable: RefCell<Option<mpsc::Sender<Frame>>>,
}

impl ChannelTransport {
    pub fn new(unreliable_capacity: usize) -> (Self, OutboundQueues) {
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let (unreliable_tx, unreliable_rx) = mpsc::channel(unreliable_capacity.max(1));

        let transport = Self {
            reliable: RefCell::new(Some(reliable_tx)),
            unreliable: RefCell::new(Some(unreliable_tx)),
        };
        let queues = OutboundQueues {
            reliable: reliable_rx,
            unreliable: unreliable_rx,
        };
        (transport, queues)
    }

    /// Stop accepting frames; the writer drains what is queued and exits
    pub fn close(&self) {
        self.reliable.borrow_mut().take();
        self.unreliable.borrow_mut().take();
    }

    pub fn is_closed(&self) -> bool {
        self.reliable
            .borrow()
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Frame, reliability: Reliability) -> Result<()> {
        match reliability {
            Reliability::Reliable => {
                let sender = self.reliable.borrow();
                let sender = sender.as_ref().ok_or(CoreError::TransportClosed)?;
                sender.send(frame).map_err(|_| CoreError::TransportClosed)
            }
            Reliability::Unreliable => {
                let sender = self.unreliable.borrow();
                let sender = sender.as_ref().ok_or(CoreError::TransportClosed)?;
                match sender.try_send(frame) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(frame)) => {
                        trace!("Unreliable queue full, dropping '{}'", frame.name());
                        Ok(())
                    }
                    Err(TrySendError::Closed(_)) => Err(CoreError::TransportClosed),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mps_protocol::Value;

    fn call(name: &str) -> Frame {
        Frame::Call {
            name: name.to_string(),
            args: vec![Value::Int(1)],
        }
    }

    #[test]
    fn test_reliable_frames_keep_order() {
        let (transport, mut queues) = ChannelTransport::new(4);
        for name in ["a", "b", "c"] {
            transport.send(call(name), Reliability::Reliable).unwrap();
        }

        let names: Vec<String> = std::iter::from_fn(|| queues.reliable.try_recv().ok())
            .map(|frame| frame.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unreliable_overflow_is_dropped() {
        let (transport, mut queues) = ChannelTransport::new(2);
        for name in ["a", "b", "c", "d"] {
            transport.send(call(name), Reliability::Unreliable).unwrap();
        }

        let mut received = 0;
        while queues.unreliable.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (transport, _queues) = ChannelTransport::new(2);
        transport.close();

        assert!(transport.is_closed());
        assert!(matches!(
            transport.send(call("x"), Reliability::Reliable),
            Err(CoreError::TransportClosed)
        ));
        assert!(matches!(
            transport.send(call("x"), Reliability::Unreliable),
            Err(CoreError::TransportClosed)
        ));
    }

    #[test]
    fn test_dropped_receiver_reports_closed() {
        let (transport, queues) = ChannelTransport::new(2);
        drop(queues);

        assert!(transport.is_closed());
        assert!(transport.send(call("x"), Reliability::Reliable).is_err());
    }
}
