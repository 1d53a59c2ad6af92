use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use super::{
    Advertise, Inbound, InboundSender, Transport, TransportStartError, bind_socket, resolve,
    stop_task, task_alive,
};
use crate::{
    protocol::CONNECTION_IDLE_TIMEOUT,
    types::{ContactAddr, Protocol},
    wire::{self, Announcement, WireError},
};

const LISTEN_BACKLOG: i32 = 1024;

pub struct TcpTransport {
    inbound: InboundSender,
    task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(inbound: InboundSender) -> Self {
        Self {
            inbound,
            task: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn start(&mut self, endpoint: &ContactAddr) -> Result<Advertise, TransportStartError> {
        stop_task(&mut self.task, Protocol::Tcp).await;

        let addr = resolve(endpoint).await?;
        let listener = bind_socket(addr, socket2::Type::STREAM, socket2::Protocol::TCP)
            .and_then(|socket| {
                socket.listen(LISTEN_BACKLOG)?;
                TcpListener::from_std(socket.into())
            })
            .map_err(|e| TransportStartError::from_io(endpoint, &e))?;
        let local = listener
            .local_addr()
            .map_err(|e| TransportStartError::from_io(endpoint, &e))?;

        info!(%local, "tcp listener started");
        self.task = Some(tokio::spawn(accept_loop(listener, self.inbound.clone())));
        Ok(Advertise::External { port: local.port() })
    }

    async fn stop(&mut self) {
        stop_task(&mut self.task, Protocol::Tcp).await;
    }

    fn probe(&self) -> bool {
        task_alive(&self.task)
    }
}

/// Connection tasks live in the loop's `JoinSet`, so aborting the loop on
/// `stop` tears down every open connection with it.
async fn accept_loop(listener: TcpListener, inbound: InboundSender) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, inbound.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, inbound: InboundSender) {
    loop {
        let read = tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, wire::read_message(&mut stream));
        let announcement: Announcement = match read.await {
            Ok(Ok(announcement)) => announcement,
            Ok(Err(WireError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "dropping tcp connection");
                break;
            }
            Err(_) => {
                debug!(%peer, "closing idle tcp connection");
                break;
            }
        };

        match announcement.verify() {
            Ok(()) => {
                debug!(%peer, node_id = %announcement.node_id, "tcp announcement received");
                let delivered = inbound.send(Inbound {
                    protocol: Protocol::Tcp,
                    peer,
                    announcement,
                });
                if delivered.is_err() {
                    break;
                }
            }
            Err(e) => warn!(%peer, error = %e, "rejected tcp announcement"),
        }
    }
}
