use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use stun::{
    agent::TransactionId,
    message::{BINDING_REQUEST, Getter, Message},
    xoraddr::XorMappedAddress,
};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::protocol::{HTTP_DISCOVERY_TIMEOUT, STUN_TIMEOUT};

/// What the outside world sees of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalAddress {
    pub external: IpAddr,
    /// Address of the default interface, when it could be read.
    pub local: Option<IpAddr>,
}

impl ExternalAddress {
    /// An unknown local address counts as NAT.
    pub fn behind_nat(&self) -> bool {
        self.local != Some(self.external)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("external address probe timed out")]
    Timeout,
    #[error("external address unavailable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> Result<ExternalAddress, ProbeError>;
}

// ─── STUN + HTTP probe ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StunProbe {
    stun_servers: Vec<String>,
    discovery_urls: Vec<String>,
    client: reqwest::Client,
}

impl StunProbe {
    pub fn new(stun_servers: Vec<String>, discovery_urls: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_DISCOVERY_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            stun_servers,
            discovery_urls,
            client,
        })
    }

    async fn via_stun(&self, timed_out: &mut bool) -> Option<IpAddr> {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "failed to bind STUN socket");
                return None;
            }
        };

        for server in &self.stun_servers {
            match stun_binding_request(&socket, server).await {
                Ok(mapped) if mapped.ip().is_unspecified() => {
                    warn!(%server, "STUN server reported an unspecified address");
                }
                Ok(mapped) => {
                    debug!(%server, %mapped, "STUN binding response");
                    return Some(mapped.ip());
                }
                Err(StunFailure::Timeout) => {
                    *timed_out = true;
                    warn!(%server, "STUN request timed out");
                }
                Err(StunFailure::Other(e)) => {
                    warn!(%server, "STUN request failed: {e:#}");
                }
            }
        }
        None
    }

    async fn via_http(&self, timed_out: &mut bool) -> Option<IpAddr> {
        for url in &self.discovery_urls {
            match self.fetch_ip(url).await {
                Ok(ip) if ip.is_unspecified() => {
                    warn!(%url, "discovery service reported an unspecified address");
                }
                Ok(ip) => {
                    debug!(%url, %ip, "discovery service response");
                    return Some(ip);
                }
                Err(e) => {
                    if e.is_timeout() {
                        *timed_out = true;
                    }
                    warn!(%url, error = %e, "external IP discovery failed");
                }
            }
        }
        None
    }

    async fn fetch_ip(&self, url: &str) -> Result<IpAddr, DiscoveryFailure> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse()
            .map_err(|_| DiscoveryFailure::Malformed(body.trim().to_string()))
    }
}

#[async_trait]
impl Probe for StunProbe {
    async fn probe(&self) -> Result<ExternalAddress, ProbeError> {
        let mut timed_out = false;
        let external = match self.via_stun(&mut timed_out).await {
            Some(ip) => ip,
            None => self
                .via_http(&mut timed_out)
                .await
                .ok_or_else(|| match timed_out {
                    true => ProbeError::Timeout,
                    false => ProbeError::Unreachable("no STUN or HTTP source answered".into()),
                })?,
        };
        let local = detect_local_ip(external);
        info!(%external, local = ?local, "external address probed");
        Ok(ExternalAddress { external, local })
    }
}

#[derive(Debug, thiserror::Error)]
enum DiscoveryFailure {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed address in response: {0:?}")]
    Malformed(String),
}

impl DiscoveryFailure {
    fn is_timeout(&self) -> bool {
        match self {
            DiscoveryFailure::Http(e) => e.is_timeout(),
            DiscoveryFailure::Malformed(_) => false,
        }
    }
}

#[derive(Debug)]
enum StunFailure {
    Timeout,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for StunFailure {
    fn from(e: anyhow::Error) -> Self {
        StunFailure::Other(e)
    }
}

/// Address of the default interface in the same family as `external`.
fn detect_local_ip(external: IpAddr) -> Option<IpAddr> {
    let iface = default_net::get_default_interface().ok()?;
    match external {
        IpAddr::V4(_) => iface.ipv4.first().map(|net| IpAddr::V4(net.addr)),
        IpAddr::V6(_) => iface.ipv6.first().map(|net| IpAddr::V6(net.addr)),
    }
}

async fn stun_binding_request(socket: &UdpSocket, server: &str) -> Result<SocketAddr, StunFailure> {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to build STUN binding request")?;

    let dest: SocketAddr = tokio::net::lookup_host(server)
        .await
        .context("DNS lookup failed")?
        .next()
        .context("no addresses resolved for STUN server")?;

    socket
        .send_to(&msg.raw, dest)
        .await
        .context("failed to send STUN request")?;

    let mut buf = [0u8; 1024];
    let (n, src) = tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StunFailure::Timeout)?
        .context("failed to receive STUN response")?;

    if src != dest {
        return Err(anyhow::anyhow!("STUN response from unexpected source {src}, expected {dest}").into());
    }

    let mut resp = Message::new();
    resp.write(buf.get(..n).context("response buffer slice out of bounds")?)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to decode STUN response")?;

    let mut xor_addr = XorMappedAddress::default();
    xor_addr
        .get_from(&resp)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to extract XOR-MAPPED-ADDRESS")?;

    Ok(SocketAddr::new(xor_addr.ip, xor_addr.port))
}

// ─── Connectivity ───────────────────────────────────────────────────────────

/// Whether a well-known endpoint accepts a TCP connection. Separates "the
/// internet is down" from "nobody can reach us".
pub async fn check_connectivity(endpoint: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(%endpoint, error = %e, "connectivity check failed");
            false
        }
        Err(_) => {
            debug!(%endpoint, "connectivity check timed out");
            false
        }
    }
}
