//! Raw frames and message kinds

use bytes::Bytes;
use std::fmt;

/// Message kinds understood on a control or data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Auth = 0x01,
    AuthResult = 0x02,
    RegisterTunnel = 0x10,
    RegisterTunnelResult = 0x11,
    NewDataChannel = 0x20,
    DataChannelReady = 0x21,
    Ping = 0x30,
    Pong = 0x31,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Auth => "Auth",
            MessageKind::AuthResult => "AuthResult",
            MessageKind::RegisterTunnel => "RegisterTunnel",
            MessageKind::RegisterTunnelResult => "RegisterTunnelResult",
            MessageKind::NewDataChannel => "NewDataChannel",
            MessageKind::DataChannelReady => "DataChannelReady",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::Auth),
            0x02 => Ok(MessageKind::AuthResult),
            0x10 => Ok(MessageKind::RegisterTunnel),
            0x11 => Ok(MessageKind::RegisterTunnelResult),
            0x20 => Ok(MessageKind::NewDataChannel),
            0x21 => Ok(MessageKind::DataChannelReady),
            0x30 => Ok(MessageKind::Ping),
            0x31 => Ok(MessageKind::Pong),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single framed message: a kind plus an opaque body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Frame with an empty body (heartbeats)
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            body: Bytes::new(),
        }
    }

    /// Total size on the wire, header included
    pub fn wire_len(&self) -> usize {
        crate::HEADER_SIZE + self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bytes_round_trip() {
        let kinds = [
            MessageKind::Auth,
            MessageKind::AuthResult,
            MessageKind::RegisterTunnel,
            MessageKind::RegisterTunnelResult,
            MessageKind::NewDataChannel,
            MessageKind::DataChannelReady,
            MessageKind::Ping,
            MessageKind::Pong,
        ];

        for kind in kinds {
            assert_eq!(MessageKind::try_from(kind.as_u8()), Ok(kind));
        }
    }

    #[test]
    fn test_unknown_kind_byte() {
        assert_eq!(MessageKind::try_from(0x00), Err(0x00));
        assert_eq!(MessageKind::try_from(0x7f), Err(0x7f));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::DataChannelReady.to_string(), "DataChannelReady");
        assert_eq!(format!("{}", MessageKind::Ping), "Ping");
    }
}
