pub mod relay;
pub mod supervisor;
pub mod tcp;
pub mod udp;

use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

pub use self::{
    relay::RelayTransport,
    supervisor::{SupervisorHandle, TransportSupervisor, spawn_supervisor},
    tcp::TcpTransport,
    udp::UdpTransport,
};
use crate::{
    types::{ContactAddr, Protocol},
    wire::Announcement,
};

// ─── Transport contract ─────────────────────────────────────────────────────

/// How a running transport should appear in the published contact list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advertise {
    /// The node's external IP with this port.
    External { port: u16 },
    /// A fixed address that does not depend on the node's own IP.
    Fixed(ContactAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportStartError {
    #[error("{0} is already in use")]
    PortInUse(String),
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("{0} is unreachable")]
    Unreachable(String),
    #[error("I/O error on {endpoint}: {message}")]
    Io { endpoint: String, message: String },
}

impl TransportStartError {
    pub fn from_io(endpoint: impl ToString, e: &io::Error) -> Self {
        let endpoint = endpoint.to_string();
        match e.kind() {
            io::ErrorKind::AddrInUse => TransportStartError::PortInUse(endpoint),
            io::ErrorKind::PermissionDenied => TransportStartError::PermissionDenied(endpoint),
            io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotFound => TransportStartError::Unreachable(endpoint),
            _ => TransportStartError::Io {
                endpoint,
                message: e.to_string(),
            },
        }
    }
}

/// A verified announcement that arrived on one of the listeners.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub protocol: Protocol,
    pub peer: SocketAddr,
    pub announcement: Announcement,
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn start(&mut self, endpoint: &ContactAddr) -> Result<Advertise, TransportStartError>;

    async fn stop(&mut self);

    /// True while the listener task is alive.
    fn probe(&self) -> bool;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, protocol: Protocol) -> Box<dyn Transport>;
}

/// Builds the socket-backed transports.
#[derive(Debug, Clone)]
pub struct SocketTransports {
    node_id: String,
    inbound: InboundSender,
}

impl SocketTransports {
    pub fn new(node_id: String, inbound: InboundSender) -> Self {
        Self { node_id, inbound }
    }
}

impl TransportFactory for SocketTransports {
    fn create(&self, protocol: Protocol) -> Box<dyn Transport> {
        match protocol {
            Protocol::Tcp => Box::new(TcpTransport::new(self.inbound.clone())),
            Protocol::Udp => Box::new(UdpTransport::new(self.inbound.clone())),
            Protocol::Relay => Box::new(RelayTransport::new(
                self.node_id.clone(),
                self.inbound.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<Protocol>,
    pub stopped: Vec<Protocol>,
    pub failed: Vec<(Protocol, TransportStartError)>,
    pub listening: BTreeMap<Protocol, Advertise>,
}

// ─── Shared helpers ─────────────────────────────────────────────────────────

async fn resolve(endpoint: &ContactAddr) -> Result<SocketAddr, TransportStartError> {
    if let Some(addr) = endpoint.socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host(endpoint.to_string())
        .await
        .map_err(|e| TransportStartError::from_io(endpoint, &e))?
        .next()
        .ok_or_else(|| TransportStartError::Unreachable(endpoint.to_string()))
}

/// Bind a non-blocking socket. Stream sockets get `SO_REUSEADDR` so a
/// restarted listener can reclaim a port still in TIME_WAIT. Datagram sockets
/// do not: on Linux it would let two listeners share the port silently.
fn bind_socket(addr: SocketAddr, ty: socket2::Type, proto: socket2::Protocol) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, ty, Some(proto))?;
    if ty == socket2::Type::STREAM {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn task_alive(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}

async fn stop_task(task: &mut Option<JoinHandle<()>>, protocol: Protocol) {
    if let Some(task) = task.take() {
        task.abort();
        let _ = task.await;
        debug!(%protocol, "listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_start_errors() {
        let endpoint = "0.0.0.0:7771";
        assert_eq!(
            TransportStartError::from_io(endpoint, &io::Error::from(io::ErrorKind::AddrInUse)),
            TransportStartError::PortInUse(endpoint.into())
        );
        assert_eq!(
            TransportStartError::from_io(endpoint, &io::Error::from(io::ErrorKind::PermissionDenied)),
            TransportStartError::PermissionDenied(endpoint.into())
        );
        assert_eq!(
            TransportStartError::from_io(endpoint, &io::Error::from(io::ErrorKind::ConnectionRefused)),
            TransportStartError::Unreachable(endpoint.into())
        );
        assert!(matches!(
            TransportStartError::from_io(endpoint, &io::Error::other("boom")),
            TransportStartError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn second_bind_on_a_live_tcp_port_fails() {
        let first = bind_socket(
            "127.0.0.1:0".parse().expect("valid addr"),
            socket2::Type::STREAM,
            socket2::Protocol::TCP,
        )
        .expect("first bind");
        first.listen(16).expect("listen");
        let addr = first
            .local_addr()
            .expect("local addr")
            .as_socket()
            .expect("inet addr");

        let second = bind_socket(addr, socket2::Type::STREAM, socket2::Protocol::TCP)
            .and_then(|s| s.listen(16));
        assert!(second.is_err());
    }

    #[test]
    fn second_bind_on_a_live_udp_port_is_refused() {
        let first = bind_socket(
            "127.0.0.1:0".parse().expect("valid addr"),
            socket2::Type::DGRAM,
            socket2::Protocol::UDP,
        )
        .expect("first bind");
        let addr = first
            .local_addr()
            .expect("local addr")
            .as_socket()
            .expect("inet addr");

        let err = bind_socket(addr, socket2::Type::DGRAM, socket2::Protocol::UDP)
            .expect_err("udp port shared between two sockets");
        assert_eq!(
            TransportStartError::from_io(addr, &err),
            TransportStartError::PortInUse(addr.to_string())
        );
    }
}
