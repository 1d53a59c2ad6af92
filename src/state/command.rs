use std::{
    collections::BTreeSet,
    net::IpAddr,
    time::Duration,
};

use crate::types::{Contact, Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // ─── Offloaded to workers ───────────────────────────────────────────────
    Probe {
        generation: u64,
        delay: Duration,
    },
    Retry {
        generation: u64,
        delay: Duration,
    },
    Reconcile {
        generation: u64,
        desired: BTreeSet<Protocol>,
    },
    MapPorts {
        generation: u64,
        ports: Vec<(Protocol, u16)>,
    },
    Announce,
    CheckConnectivity,

    // ─── Executed inline against NodeIdentity ───────────────────────────────
    PublishIdentity {
        external: IpAddr,
        contacts: Vec<Contact>,
        demote: BTreeSet<Protocol>,
    },
    PromoteContact {
        protocol: Protocol,
    },
}
