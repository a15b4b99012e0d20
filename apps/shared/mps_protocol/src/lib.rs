pub mod entity;
pub mod error;
pub mod frame;
pub mod stream;
pub mod value;

pub use entity::{EntityKind, EntityRef};
pub use error::{ProtocolError, Result};
pub use frame::{Frame, FrameKind, Reliability};
pub use stream::{DEFAULT_MAX_FRAME_SIZE, FrameReader, FrameWriter};
pub use value::{Value, Vector3};
