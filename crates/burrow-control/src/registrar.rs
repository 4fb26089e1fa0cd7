//! Tunnel registration: request validation, port policy and public binds

use crate::session::TunnelDescriptor;
use burrow_proto::{RegisterTunnelRequest, TUNNEL_TYPE_TCP};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;

/// Reasons a registration is refused. The display text is sent back to the
/// agent, and the session stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("malformed register request: {0}")]
    Malformed(String),

    #[error("unsupported tunnel type '{0}'")]
    UnsupportedType(String),

    #[error("tunnel name must not be empty")]
    EmptyName,

    #[error("tunnel '{0}' is already registered")]
    DuplicateName(String),

    #[error("private address must not be empty")]
    EmptyPrivateAddress,

    #[error("public port {0} is out of range (1-65535)")]
    InvalidPort(u32),

    #[error("public port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("failed to bind public port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

/// Whitelist of public ports; empty allows every port
#[derive(Debug, Clone, Default)]
pub struct PortPolicy {
    allowed: HashSet<u16>,
}

impl PortPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            allowed: ports.into_iter().collect(),
        }
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&port)
    }
}

#[derive(Debug, Clone)]
pub struct TunnelRegistrar {
    policy: PortPolicy,
    bind_ip: IpAddr,
}

impl TunnelRegistrar {
    pub fn new(policy: PortPolicy, bind_ip: IpAddr) -> Self {
        Self { policy, bind_ip }
    }

    /// Check a request against the port policy and the names the session
    /// already owns
    pub fn validate(
        &self,
        request: &RegisterTunnelRequest,
        is_registered: impl Fn(&str) -> bool,
    ) -> Result<TunnelDescriptor, RegistrationError> {
        if request.tunnel_type != TUNNEL_TYPE_TCP {
            return Err(RegistrationError::UnsupportedType(
                request.tunnel_type.clone(),
            ));
        }

        let name = request.name.trim();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if is_registered(name) {
            return Err(RegistrationError::DuplicateName(name.to_string()));
        }

        if request.private_address.trim().is_empty() {
            return Err(RegistrationError::EmptyPrivateAddress);
        }

        let port = match u16::try_from(request.public_port) {
            Ok(port) if port != 0 => port,
            _ => return Err(RegistrationError::InvalidPort(request.public_port)),
        };

        if !self.policy.is_allowed(port) {
            return Err(RegistrationError::PortNotAllowed(port));
        }

        Ok(TunnelDescriptor {
            name: name.to_string(),
            private_address: request.private_address.clone(),
            public_port: port,
        })
    }

    /// Bind the public socket for a validated tunnel
    pub async fn bind(
        &self,
        descriptor: &TunnelDescriptor,
    ) -> Result<TcpListener, RegistrationError> {
        let addr = SocketAddr::new(self.bind_ip, descriptor.public_port);
        TcpListener::bind(addr)
            .await
            .map_err(|e| RegistrationError::Bind {
                port: descriptor.public_port,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(name: &str, port: u32) -> RegisterTunnelRequest {
        RegisterTunnelRequest {
            name: name.to_string(),
            tunnel_type: "tcp".to_string(),
            private_address: "127.0.0.1:3000".to_string(),
            public_port: port,
        }
    }

    fn registrar(ports: &[u16]) -> TunnelRegistrar {
        TunnelRegistrar::new(
            PortPolicy::new(ports.iter().copied()),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    #[test]
    fn test_empty_policy_allows_all() {
        let policy = PortPolicy::allow_all();
        assert!(policy.is_allowed(1));
        assert!(policy.is_allowed(65535));
    }

    #[test]
    fn test_whitelist() {
        let registrar = registrar(&[8080]);

        let descriptor = registrar.validate(&request("web", 8080), |_| false).unwrap();
        assert_eq!(descriptor.public_port, 8080);
        assert_eq!(descriptor.private_address, "127.0.0.1:3000");

        let err = registrar.validate(&request("web", 9090), |_| false).unwrap_err();
        assert_eq!(err, RegistrationError::PortNotAllowed(9090));
        assert_eq!(err.to_string(), "public port 9090 is not allowed");
    }

    #[test]
    fn test_rejects_bad_requests() {
        let registrar = registrar(&[]);

        let mut udp = request("dns", 5353);
        udp.tunnel_type = "udp".to_string();
        assert_eq!(
            registrar.validate(&udp, |_| false),
            Err(RegistrationError::UnsupportedType("udp".to_string()))
        );

        assert_eq!(
            registrar.validate(&request("  ", 8080), |_| false),
            Err(RegistrationError::EmptyName)
        );
        assert_eq!(
            registrar.validate(&request("web", 0), |_| false),
            Err(RegistrationError::InvalidPort(0))
        );
        assert_eq!(
            registrar.validate(&request("web", 70000), |_| false),
            Err(RegistrationError::InvalidPort(70000))
        );
        assert_eq!(
            registrar.validate(&request("web", 8080), |name| name == "web"),
            Err(RegistrationError::DuplicateName("web".to_string()))
        );

        let mut no_target = request("web", 8080);
        no_target.private_address = String::new();
        assert_eq!(
            registrar.validate(&no_target, |_| false),
            Err(RegistrationError::EmptyPrivateAddress)
        );
    }

    #[tokio::test]
    async fn test_bind_failure_is_distinct() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let registrar = registrar(&[]);
        let descriptor = registrar.validate(&request("web", port as u32), |_| false).unwrap();

        let err = registrar.bind(&descriptor).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Bind { port: p, .. } if p == port));
        assert!(err.to_string().starts_with(&format!("failed to bind public port {}", port)));

        drop(occupied);
        let listener = registrar.bind(&descriptor).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }
}
