//! Burrow control protocol
//!
//! Defines the frame layout spoken between a broker and its agents, the closed
//! set of message kinds, and the JSON bodies each kind carries.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use frame::{Frame, MessageKind};
pub use messages::*;

/// Version string agents report during authentication
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum frame body size (64 KiB)
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Frame header size: kind (1) + body length (4)
pub const HEADER_SIZE: usize = 5;
