use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::frame::Frame;

/// Default maximum frame size: 25MB (configurable via the session's max_frame_size)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 25 * 1024 * 1024;

/// Extension trait for byte streams to read Frames
pub trait FrameReader {
    /// Read a Frame from the stream
    /// Format: [4 bytes length][frame bytes]
    async fn read_frame(&mut self, max_size: usize) -> Result<Frame>;
}

/// Extension trait for byte streams to write Frames
pub trait FrameWriter {
    /// Write a Frame to the stream and flush it
    /// Format: [4 bytes length][frame bytes]
    async fn write_frame(&mut self, frame: &Frame, max_size: usize) -> Result<()>;
}

impl<R: AsyncRead + Unpin> FrameReader for R {
    async fn read_frame(&mut self, max_size: usize) -> Result<Frame> {
        // Read frame length (4 bytes, big-endian)
        let len = match self.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        };

        if len > max_size {
            return Err(ProtocolError::FrameTooLarge(len, max_size));
        }

        if len == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut buffer = vec![0u8; len];
        self.read_exact(&mut buffer).await?;

        Frame::from_bytes(&buffer).map_err(Into::into)
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter for W {
    async fn write_frame(&mut self, frame: &Frame, max_size: usize) -> Result<()> {
        let data = frame.to_bytes()?;

        if data.len() > max_size {
            return Err(ProtocolError::FrameTooLarge(data.len(), max_size));
        }

        self.write_u32(data.len() as u32).await?;
        self.write_all(&data).await?;

        // Frames are small and latency-bound, so each one goes out immediately
        self.flush().await?;

        Ok(())
    }
}
