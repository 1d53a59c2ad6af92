use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    num::NonZeroU16,
};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    protocol::{PORT_MAPPING_DESCRIPTION, PORT_MAPPING_LEASE, PORT_MAPPING_TIMEOUT},
    types::Protocol,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub external_port: u16,
    pub method: &'static str,
}

fn igd_protocol(protocol: Protocol) -> Option<igd_next::PortMappingProtocol> {
    match protocol {
        Protocol::Tcp => Some(igd_next::PortMappingProtocol::TCP),
        Protocol::Udp => Some(igd_next::PortMappingProtocol::UDP),
        Protocol::Relay => None,
    }
}

fn crab_protocol(protocol: Protocol) -> Option<crab_nat::InternetProtocol> {
    match protocol {
        Protocol::Tcp => Some(crab_nat::InternetProtocol::Tcp),
        Protocol::Udp => Some(crab_nat::InternetProtocol::Udp),
        Protocol::Relay => None,
    }
}

fn detect_gateway() -> Result<Ipv4Addr> {
    let gw = default_net::get_default_gateway()
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to detect default gateway")?;

    match gw.ip_addr {
        IpAddr::V4(ipv4) => Ok(ipv4),
        IpAddr::V6(ipv6) => anyhow::bail!("gateway has IPv6 address {ipv6}, expected IPv4"),
    }
}

fn detect_local_addr() -> Result<Ipv4Addr> {
    default_net::get_interfaces()
        .iter()
        .filter(|iface| !iface.is_loopback())
        .flat_map(|iface| iface.ipv4.iter().map(|net| net.addr))
        .find(|addr| !addr.is_loopback() && !addr.is_link_local())
        .context("no non-loopback, non-link-local IPv4 address found")
}

/// UPnP treats a zero lease as permanent; always ask for a finite one.
fn lease_secs() -> u32 {
    u32::try_from(PORT_MAPPING_LEASE.as_secs()).unwrap_or(u32::MAX)
}

async fn try_upnp(protocol: Protocol, internal_port: u16, local_ip: Ipv4Addr) -> Result<PortMapping> {
    let igd = igd_protocol(protocol).context("protocol has no UPnP mapping")?;
    let gw = igd_next::aio::tokio::search_gateway(igd_next::SearchOptions {
        timeout: Some(PORT_MAPPING_TIMEOUT),
        ..Default::default()
    })
    .await
    .map_err(|e| anyhow::anyhow!("UPnP gateway search failed: {e}"))?;

    gw.add_port(
        igd,
        internal_port,
        SocketAddr::V4(SocketAddrV4::new(local_ip, internal_port)),
        lease_secs(),
        PORT_MAPPING_DESCRIPTION,
    )
    .await
    .map_err(|e| anyhow::anyhow!("UPnP add port failed: {e}"))?;

    Ok(PortMapping {
        protocol,
        external_port: internal_port,
        method: "UPnP",
    })
}

async fn try_nat_pmp_pcp(
    protocol: Protocol,
    internal_port: u16,
    gateway_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
) -> Result<PortMapping> {
    let crab = crab_protocol(protocol).context("protocol has no NAT-PMP mapping")?;
    let port = NonZeroU16::new(internal_port).context("port must be non-zero")?;

    let mapping = crab_nat::PortMapping::new(
        IpAddr::V4(gateway_ip),
        IpAddr::V4(local_ip),
        crab,
        port,
        crab_nat::PortMappingOptions::default(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("NAT-PMP/PCP failed: {e:?}"))?;

    let method = match mapping.mapping_type() {
        crab_nat::PortMappingType::Pcp { .. } => "PCP",
        crab_nat::PortMappingType::NatPmp => "NAT-PMP",
    };

    Ok(PortMapping {
        protocol,
        external_port: mapping.external_port().get(),
        method,
    })
}

/// Race UPnP against NAT-PMP/PCP for one port. `None` when neither gateway
/// protocol produced a mapping in time.
pub async fn acquire_port_mapping(protocol: Protocol, internal_port: u16) -> Option<PortMapping> {
    let (gateway_ip, local_ip) = match detect_gateway().and_then(|gw| {
        let local = detect_local_addr()?;
        Ok((gw, local))
    }) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%protocol, "port mapping: network detection failed: {e:#}");
            return None;
        }
    };

    let result = tokio::time::timeout(PORT_MAPPING_TIMEOUT, async {
        let upnp = try_upnp(protocol, internal_port, local_ip);
        let nat_pmp = try_nat_pmp_pcp(protocol, internal_port, gateway_ip, local_ip);

        tokio::pin!(upnp);
        tokio::pin!(nat_pmp);

        let mut upnp_done = false;
        let mut nat_pmp_done = false;

        loop {
            tokio::select! {
                result = &mut upnp, if !upnp_done => match result {
                    Ok(mapping) => return Some(mapping),
                    Err(e) => {
                        warn!(%protocol, "port mapping: UPnP failed: {e:#}");
                        upnp_done = true;
                    }
                },
                result = &mut nat_pmp, if !nat_pmp_done => match result {
                    Ok(mapping) => return Some(mapping),
                    Err(e) => {
                        warn!(%protocol, "port mapping: NAT-PMP/PCP failed: {e:#}");
                        nat_pmp_done = true;
                    }
                },
            }

            if upnp_done && nat_pmp_done {
                return None;
            }
        }
    })
    .await;

    match result {
        Ok(Some(mapping)) => {
            info!(
                %protocol,
                internal_port,
                external_port = mapping.external_port,
                method = mapping.method,
                "port mapping: succeeded"
            );
            Some(mapping)
        }
        Ok(None) => None,
        Err(_) => {
            warn!(%protocol, "port mapping: all methods timed out");
            None
        }
    }
}

/// Map every requested port. Protocols absent from the result had no mapping.
pub async fn map_ports(ports: &[(Protocol, u16)]) -> BTreeMap<Protocol, u16> {
    let attempts = ports
        .iter()
        .map(|&(protocol, port)| acquire_port_mapping(protocol, port));
    futures::future::join_all(attempts)
        .await
        .into_iter()
        .flatten()
        .map(|m| (m.protocol, m.external_port))
        .collect()
}
