//! TCP connection to the remote peer
//!
//! A session owns two tasks: a reader turning frames from the socket into
//! [`Inbound`] messages, and a writer draining the transport's queues into the
//! socket. Reliable frames are written before queued unreliable ones.

use std::net::SocketAddr;
use std::rc::Rc;

use mps_protocol::{FrameReader, FrameWriter, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bridge::Inbound;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::transport::{ChannelTransport, OutboundQueues};

pub struct Session {
    peer: SocketAddr,
    transport: Rc<ChannelTransport>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Connect to `addr` and start the reader and writer tasks
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: &SessionConfig,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ProtocolError::from)?;
        Self::attach(stream, config, inbound)
    }

    /// Run a session over an already connected stream
    pub fn attach(
        stream: TcpStream,
        config: &SessionConfig,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Self> {
        let peer = stream.peer_addr().map_err(ProtocolError::from)?;
        stream.set_nodelay(true).map_err(ProtocolError::from)?;

        let max_frame_size = config.max_frame_size.as_bytes();
        let (transport, queues) = ChannelTransport::new(config.unreliable_queue);
        let (read_half, write_half) = stream.into_split();

        let reader = tokio::spawn(read_loop(read_half, inbound, max_frame_size, peer));
        let writer = tokio::spawn(write_loop(write_half, queues, max_frame_size, peer));
        info!(peer = %peer, "Connected");

        Ok(Self {
            peer,
            transport: Rc::new(transport),
            reader,
            writer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Outbound side, shared with the event bus and the RPC client
    pub fn transport(&self) -> Rc<ChannelTransport> {
        Rc::clone(&self.transport)
    }

    /// Flush queued frames and shut the connection down
    pub async fn close(self) {
        self.transport.close();
        if let Err(err) = self.writer.await {
            warn!(peer = %self.peer, "Writer task failed: {}", err);
        }
        self.reader.abort();
        debug!(peer = %self.peer, "Session closed");
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Inbound>,
    max_frame_size: usize,
    peer: SocketAddr,
) {
    loop {
        match half.read_frame(max_frame_size).await {
            Ok(frame) => {
                trace!(peer = %peer, "Received {:?} '{}'", frame.kind(), frame.name());
                if inbound.send(Inbound::Frame(frame)).is_err() {
                    debug!(peer = %peer, "Inbound queue closed, stopping reader");
                    return;
                }
            }
            Err(ProtocolError::ConnectionClosed) => {
                info!(peer = %peer, "Connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(peer = %peer, "Read failed: {}", err);
                break;
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected);
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut queues: OutboundQueues,
    max_frame_size: usize,
    peer: SocketAddr,
) {
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = queues.reliable.recv() => frame,
            Some(frame) = queues.unreliable.recv() => frame,
            else => break,
        };

        match half.write_frame(&frame, max_frame_size).await {
            Ok(()) => trace!(peer = %peer, "Sent {:?} '{}'", frame.kind(), frame.name()),
            Err(ProtocolError::FrameTooLarge(size, max)) => {
                warn!(peer = %peer, "Dropping '{}': {} bytes exceeds {}", frame.name(), size, max);
            }
            Err(err) => {
                warn!(peer = %peer, "Write failed: {}", err);
                return;
            }
        }
    }

    let _ = half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameLimit;
    use crate::transport::Transport;
    use mps_protocol::{Frame, Reliability, Value};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_cross_the_socket_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let max = SessionConfig::default().max_frame_size.as_bytes();

            let received = socket.read_frame(max).await.unwrap();
            socket
                .write_frame(
                    &Frame::Event {
                        name: "welcome".to_string(),
                        args: vec![Value::from("hi")],
                    },
                    max,
                )
                .await
                .unwrap();
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::connect(addr, &SessionConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(session.peer_addr(), addr);

        session
            .transport()
            .send(
                Frame::Call {
                    name: "ready".to_string(),
                    args: vec![],
                },
                Reliability::Reliable,
            )
            .unwrap();

        assert_eq!(peer.await.unwrap().name(), "ready");
        assert_eq!(
            rx.recv().await,
            Some(Inbound::Frame(Frame::Event {
                name: "welcome".to_string(),
                args: vec![Value::from("hi")],
            }))
        );
        // Peer task ended and dropped its socket
        assert_eq!(rx.recv().await, Some(Inbound::Disconnected));

        session.close().await;
    }

    #[tokio::test]
    async fn test_oversized_outbound_frame_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SessionConfig {
            max_frame_size: FrameLimit::new(64).unwrap(),
            unreliable_queue: 4,
        };

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read_frame(1024).await.unwrap()
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::connect(addr, &config, tx).await.unwrap();
        let transport = session.transport();
        transport
            .send(
                Frame::Call {
                    name: "huge".to_string(),
                    args: vec![Value::from("x".repeat(200))],
                },
                Reliability::Reliable,
            )
            .unwrap();
        transport
            .send(
                Frame::Call {
                    name: "small".to_string(),
                    args: vec![],
                },
                Reliability::Reliable,
            )
            .unwrap();

        assert_eq!(peer.await.unwrap().name(), "small");
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Session::connect(addr, &SessionConfig::default(), tx).await;
        assert!(matches!(
            result,
            Err(crate::error::CoreError::Protocol(ProtocolError::Io(_)))
        ));
    }
}
