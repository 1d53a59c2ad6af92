use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::{net::TcpStream, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    Advertise, Inbound, InboundSender, Transport, TransportStartError, resolve, stop_task,
    task_alive,
};
use crate::{
    protocol::RELAY_CONNECT_TIMEOUT,
    types::{ContactAddr, Protocol},
    wire::{self, RelayFrame},
};

/// Keeps a registration open on a relay server and surfaces the
/// announcements it forwards. The relay's own address is the contact.
pub struct RelayTransport {
    node_id: String,
    inbound: InboundSender,
    task: Option<JoinHandle<()>>,
}

impl RelayTransport {
    pub fn new(node_id: String, inbound: InboundSender) -> Self {
        Self {
            node_id,
            inbound,
            task: None,
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Relay
    }

    async fn start(&mut self, endpoint: &ContactAddr) -> Result<Advertise, TransportStartError> {
        stop_task(&mut self.task, Protocol::Relay).await;

        let relay = resolve(endpoint).await?;
        let mut stream = tokio::time::timeout(RELAY_CONNECT_TIMEOUT, TcpStream::connect(relay))
            .await
            .map_err(|_| TransportStartError::Unreachable(endpoint.to_string()))?
            .map_err(|e| TransportStartError::from_io(endpoint, &e))?;

        let register = RelayFrame::Register {
            node_id: self.node_id.clone(),
        };
        wire::write_message(&mut stream, &register)
            .await
            .map_err(|e| TransportStartError::Io {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        info!(%relay, "registered with relay");
        self.task = Some(tokio::spawn(read_loop(stream, relay, self.inbound.clone())));
        Ok(Advertise::Fixed(endpoint.clone()))
    }

    async fn stop(&mut self) {
        stop_task(&mut self.task, Protocol::Relay).await;
    }

    fn probe(&self) -> bool {
        task_alive(&self.task)
    }
}

async fn read_loop(mut stream: TcpStream, relay: SocketAddr, inbound: InboundSender) {
    loop {
        let frame: RelayFrame = match wire::read_message(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%relay, error = %e, "relay connection lost");
                return;
            }
        };

        match frame {
            RelayFrame::Deliver { announcement } => match announcement.verify() {
                Ok(()) => {
                    debug!(%relay, node_id = %announcement.node_id, "relayed announcement received");
                    if inbound
                        .send(Inbound {
                            protocol: Protocol::Relay,
                            peer: relay,
                            announcement,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!(%relay, error = %e, "rejected relayed announcement"),
            },
            RelayFrame::Register { .. } | RelayFrame::Announce { .. } => {
                debug!(%relay, "ignoring unexpected relay frame");
            }
        }
    }
}
