//! Protocol message types

use crate::frame::{Frame, MessageKind};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only tunnel type brokers accept
pub const TUNNEL_TYPE_TCP: &str = "tcp";

/// Errors turning frames into typed messages and back
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed {kind} body: {source}")]
    MalformedBody {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {kind} body: {source}")]
    Encode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: MessageKind,
    },
}

/// Agent credentials, the first message on a control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub client_id: String,
    pub token: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Request to expose `private_address` on a public port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTunnelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    pub private_address: String,
    pub public_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTunnelResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub public_port: u16,
}

/// Broker asks the agent to open a data channel for one inbound connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataChannel {
    pub tunnel_name: String,
    pub proxy_id: String,
}

/// First and only framed message on a data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelReady {
    pub proxy_id: String,
}

/// Typed view over every frame kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Auth(AuthRequest),
    AuthResult(AuthResponse),
    RegisterTunnel(RegisterTunnelRequest),
    RegisterTunnelResult(RegisterTunnelResponse),
    NewDataChannel(NewDataChannel),
    DataChannelReady(DataChannelReady),
    Ping,
    Pong,
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Auth(_) => MessageKind::Auth,
            ControlMessage::AuthResult(_) => MessageKind::AuthResult,
            ControlMessage::RegisterTunnel(_) => MessageKind::RegisterTunnel,
            ControlMessage::RegisterTunnelResult(_) => MessageKind::RegisterTunnelResult,
            ControlMessage::NewDataChannel(_) => MessageKind::NewDataChannel,
            ControlMessage::DataChannelReady(_) => MessageKind::DataChannelReady,
            ControlMessage::Ping => MessageKind::Ping,
            ControlMessage::Pong => MessageKind::Pong,
        }
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        ControlMessage::AuthResult(AuthResponse {
            success: false,
            message: message.into(),
        })
    }

    pub fn register_failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        ControlMessage::RegisterTunnelResult(RegisterTunnelResponse {
            success: false,
            message: message.into(),
            name: name.into(),
            public_port: 0,
        })
    }

    /// Serialize into a frame. Heartbeats carry an empty body.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let kind = self.kind();
        let body = match self {
            ControlMessage::Auth(body) => to_body(kind, body)?,
            ControlMessage::AuthResult(body) => to_body(kind, body)?,
            ControlMessage::RegisterTunnel(body) => to_body(kind, body)?,
            ControlMessage::RegisterTunnelResult(body) => to_body(kind, body)?,
            ControlMessage::NewDataChannel(body) => to_body(kind, body)?,
            ControlMessage::DataChannelReady(body) => to_body(kind, body)?,
            ControlMessage::Ping | ControlMessage::Pong => Bytes::new(),
        };
        Ok(Frame { kind, body })
    }

    /// Parse a frame body according to its kind
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let kind = frame.kind;
        let message = match kind {
            MessageKind::Auth => ControlMessage::Auth(from_body(kind, &frame.body)?),
            MessageKind::AuthResult => ControlMessage::AuthResult(from_body(kind, &frame.body)?),
            MessageKind::RegisterTunnel => {
                ControlMessage::RegisterTunnel(from_body(kind, &frame.body)?)
            }
            MessageKind::RegisterTunnelResult => {
                ControlMessage::RegisterTunnelResult(from_body(kind, &frame.body)?)
            }
            MessageKind::NewDataChannel => {
                ControlMessage::NewDataChannel(from_body(kind, &frame.body)?)
            }
            MessageKind::DataChannelReady => {
                ControlMessage::DataChannelReady(from_body(kind, &frame.body)?)
            }
            MessageKind::Ping => ControlMessage::Ping,
            MessageKind::Pong => ControlMessage::Pong,
        };
        Ok(message)
    }
}

fn to_body<T: Serialize>(kind: MessageKind, body: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(|source| ProtocolError::Encode { kind, source })
}

fn from_body<T: DeserializeOwned>(kind: MessageKind, body: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|source| ProtocolError::MalformedBody { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_wire_fields() {
        let msg = ControlMessage::Auth(AuthRequest {
            client_id: "office-nas".to_string(),
            token: "secret".to_string(),
            version: crate::PROTOCOL_VERSION.to_string(),
        });

        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.kind, MessageKind::Auth);

        let json: serde_json::Value = serde_json::from_slice(&frame.body).unwrap();
        assert_eq!(json["client_id"], "office-nas");
        assert_eq!(json["token"], "secret");
        assert_eq!(json["version"], "1.0.0");

        assert_eq!(ControlMessage::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_register_tunnel_uses_type_field() {
        let frame = Frame::new(
            MessageKind::RegisterTunnel,
            &br#"{"name":"ssh","type":"tcp","private_address":"127.0.0.1:22","public_port":2222}"#[..],
        );

        match ControlMessage::from_frame(&frame).unwrap() {
            ControlMessage::RegisterTunnel(req) => {
                assert_eq!(req.name, "ssh");
                assert_eq!(req.tunnel_type, TUNNEL_TYPE_TCP);
                assert_eq!(req.private_address, "127.0.0.1:22");
                assert_eq!(req.public_port, 2222);
            }
            other => panic!("Expected RegisterTunnel, got {:?}", other),
        }
    }

    #[test]
    fn test_heartbeats_have_empty_bodies() {
        let ping = ControlMessage::Ping.to_frame().unwrap();
        assert!(ping.body.is_empty());

        // Heartbeat bodies are ignored even if a peer sends one
        let pong = Frame::new(MessageKind::Pong, &b"{}"[..]);
        assert_eq!(ControlMessage::from_frame(&pong).unwrap(), ControlMessage::Pong);
    }

    #[test]
    fn test_malformed_body() {
        let frame = Frame::new(MessageKind::Auth, &b"not json"[..]);
        let err = ControlMessage::from_frame(&frame).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedBody {
                kind: MessageKind::Auth,
                ..
            }
        ));

        // Missing required field
        let frame = Frame::new(MessageKind::DataChannelReady, &b"{}"[..]);
        assert!(ControlMessage::from_frame(&frame).is_err());
    }

    #[test]
    fn test_negative_port_is_malformed() {
        let frame = Frame::new(
            MessageKind::RegisterTunnel,
            &br#"{"name":"web","type":"tcp","private_address":"127.0.0.1:80","public_port":-1}"#[..],
        );
        assert!(ControlMessage::from_frame(&frame).is_err());
    }

    #[test]
    fn test_failure_helpers() {
        match ControlMessage::register_failure("web", "public port 9090 is not allowed") {
            ControlMessage::RegisterTunnelResult(resp) => {
                assert!(!resp.success);
                assert_eq!(resp.name, "web");
                assert_eq!(resp.public_port, 0);
            }
            other => panic!("Expected RegisterTunnelResult, got {:?}", other),
        }

        let frame = ControlMessage::auth_failure("invalid token")
            .to_frame()
            .unwrap();
        assert_eq!(frame.kind, MessageKind::AuthResult);
    }
}
