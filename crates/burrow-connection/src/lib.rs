//! Connection primitives shared by broker and agent
//!
//! A framed control connection over TCP, the bidirectional forwarding pair used
//! for data channels, and reconnect backoff for long-running agents.

pub mod connection;
pub mod forward;
pub mod reconnect;

pub use connection::{ConnectionError, ControlConnection};
pub use forward::{ForwardError, ForwardStats, ForwardingPair, DEFAULT_HALF_CLOSE_GRACE};
pub use reconnect::{Backoff, ReconnectError, ReconnectPolicy};
