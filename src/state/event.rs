use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use crate::{
    probe::{ExternalAddress, ProbeError},
    transport::ReconcileReport,
    types::Protocol,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Cadence {
    Short,
    Long,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum Event {
    // ─── External stimuli ───────────────────────────────────────────────────
    Init,
    Tick {
        cadence: Cadence,
        now: Instant,
    },
    InboundPacket {
        protocol: Protocol,
        peer: SocketAddr,
        at: Instant,
    },
    ConfigChanged {
        enabled: BTreeSet<Protocol>,
    },

    // ─── Worker completions ─────────────────────────────────────────────────
    ProbeSucceeded {
        generation: u64,
        address: ExternalAddress,
    },
    ProbeFailed {
        generation: u64,
        error: ProbeError,
    },
    RetryElapsed {
        generation: u64,
    },
    ReconcileDone {
        generation: u64,
        report: ReconcileReport,
    },
    PortMappingDone {
        generation: u64,
        mapped: BTreeMap<Protocol, u16>,
    },
    ConnectivityChecked {
        online: bool,
    },

    // ─── Inline results (identity publisher) ────────────────────────────────
    IdentityPublished {
        external: IpAddr,
        order: Vec<Protocol>,
    },
}
