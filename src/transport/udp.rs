use async_trait::async_trait;
use tokio::{net::UdpSocket, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    Advertise, Inbound, InboundSender, Transport, TransportStartError, bind_socket, resolve,
    stop_task, task_alive,
};
use crate::{
    protocol::MAX_FRAME_LEN,
    types::{ContactAddr, Protocol},
    wire::{self, Announcement},
};

pub struct UdpTransport {
    inbound: InboundSender,
    task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(inbound: InboundSender) -> Self {
        Self {
            inbound,
            task: None,
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    async fn start(&mut self, endpoint: &ContactAddr) -> Result<Advertise, TransportStartError> {
        stop_task(&mut self.task, Protocol::Udp).await;

        let addr = resolve(endpoint).await?;
        let socket = bind_socket(addr, socket2::Type::DGRAM, socket2::Protocol::UDP)
            .and_then(|socket| UdpSocket::from_std(socket.into()))
            .map_err(|e| TransportStartError::from_io(endpoint, &e))?;
        let local = socket
            .local_addr()
            .map_err(|e| TransportStartError::from_io(endpoint, &e))?;

        info!(%local, "udp listener started");
        self.task = Some(tokio::spawn(recv_loop(socket, self.inbound.clone())));
        Ok(Advertise::External { port: local.port() })
    }

    async fn stop(&mut self) {
        stop_task(&mut self.task, Protocol::Udp).await;
    }

    fn probe(&self) -> bool {
        task_alive(&self.task)
    }
}

async fn recv_loop(socket: UdpSocket, inbound: InboundSender) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "udp receive failed");
                continue;
            }
        };
        let Some(datagram) = buf.get(..n) else {
            continue;
        };

        let announcement: Announcement = match wire::decode_datagram(datagram) {
            Ok(announcement) => announcement,
            Err(e) => {
                debug!(%peer, error = %e, "ignoring malformed datagram");
                continue;
            }
        };

        match announcement.verify() {
            Ok(()) => {
                debug!(%peer, node_id = %announcement.node_id, "udp announcement received");
                if inbound
                    .send(Inbound {
                        protocol: Protocol::Udp,
                        peer,
                        announcement,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => warn!(%peer, error = %e, "rejected udp announcement"),
        }
    }
}
