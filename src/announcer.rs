use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};

use futures::future::join_all;
use libp2p::identity::Keypair;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::{
    identity::NodeIdentity,
    protocol::ANNOUNCE_TIMEOUT,
    types::{Contact, ContactParseError, Protocol},
    wire::{self, Announcement, RelayFrame, WireError},
};

// ─── Peer ───────────────────────────────────────────────────────────────────

/// Someone to announce to. Relay peers also need the node id the relay
/// knows them by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node_id: Option<String>,
    pub contact: Contact,
}

#[derive(Debug, Error)]
pub enum PeerParseError {
    #[error("empty node id before '@'")]
    EmptyNodeId,
    #[error(transparent)]
    Contact(#[from] ContactParseError),
}

impl FromStr for Peer {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some(("", _)) => Err(PeerParseError::EmptyNodeId),
            Some((node_id, contact)) => Ok(Self {
                node_id: Some(node_id.to_string()),
                contact: contact.parse()?,
            }),
            None => Ok(Self {
                node_id: None,
                contact: s.parse()?,
            }),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node_id) => write!(f, "{node_id}@{}", self.contact),
            None => write!(f, "{}", self.contact),
        }
    }
}

// ─── Errors / report ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("announcement timed out")]
    Timeout,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("relay peer has no node id")]
    MissingNodeId,
    #[error("directory request failed: {0}")]
    Directory(#[from] reqwest::Error),
}

#[derive(Debug, Default)]
pub struct AnnounceReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, AnnounceError)>,
}

// ─── Announcer ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Announcer {
    keypair: Arc<Keypair>,
    peers: Vec<Peer>,
    directory: Option<String>,
    client: reqwest::Client,
}

impl Announcer {
    pub fn new(keypair: Keypair, peers: Vec<Peer>, directory: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            keypair: Arc::new(keypair),
            peers,
            directory,
            client,
        }
    }

    /// Send the signed identity to every peer and the directory. Failures
    /// are per target and never stop the batch.
    pub async fn announce(&self, identity: &NodeIdentity) -> AnnounceReport {
        let mut report = AnnounceReport::default();

        let announcement = match Announcement::sign(identity, &self.keypair) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!(error = %e, "could not sign announcement");
                report.failed.push(("<local>".into(), e.into()));
                return report;
            }
        };

        let deliveries = self.peers.iter().map(|peer| {
            let announcement = &announcement;
            async move {
                let result = tokio::time::timeout(ANNOUNCE_TIMEOUT, send_to_peer(peer, announcement))
                    .await
                    .unwrap_or(Err(AnnounceError::Timeout));
                (peer.to_string(), result)
            }
        });
        let mut results = join_all(deliveries).await;

        if let Some(url) = &self.directory {
            let result = self.post_directory(url, &announcement).await;
            results.push((url.clone(), result));
        }

        for (target, result) in results {
            match result {
                Ok(()) => {
                    debug!(%target, "announcement delivered");
                    report.delivered.push(target);
                }
                Err(e) => {
                    warn!(%target, error = %e, "announcement failed");
                    report.failed.push((target, e));
                }
            }
        }

        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "announce round complete"
        );
        report
    }

    async fn post_directory(&self, url: &str, announcement: &Announcement) -> Result<(), AnnounceError> {
        self.client
            .post(url)
            .json(announcement)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

async fn resolve(contact: &Contact) -> Result<SocketAddr, AnnounceError> {
    if let Some(addr) = contact.address.socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host(contact.address.to_string())
        .await?
        .next()
        .ok_or_else(|| AnnounceError::Resolve(contact.address.to_string()))
}

async fn send_to_peer(peer: &Peer, announcement: &Announcement) -> Result<(), AnnounceError> {
    let target = resolve(&peer.contact).await?;
    match peer.contact.protocol {
        Protocol::Tcp => {
            let mut stream = TcpStream::connect(target).await?;
            wire::write_message(&mut stream, announcement).await?;
        }
        Protocol::Udp => {
            let bind: SocketAddr = match target {
                SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
                SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
            };
            let socket = UdpSocket::bind(bind).await?;
            socket
                .send_to(&wire::encode_datagram(announcement)?, target)
                .await?;
        }
        Protocol::Relay => {
            let to = peer.node_id.clone().ok_or(AnnounceError::MissingNodeId)?;
            let mut stream = TcpStream::connect(target).await?;
            let frame = RelayFrame::Announce {
                to,
                announcement: announcement.clone(),
            };
            wire::write_message(&mut stream, &frame).await?;
        }
    }
    Ok(())
}
