use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use libp2p::PeerId;
use proptest::prelude::*;
use strum::IntoEnumIterator;

use crate::{
    probe::{ExternalAddress, ProbeError},
    state::{Cadence, Event, MachineConfig, ReachabilityMachine},
    transport::{Advertise, ReconcileReport},
    types::{Contact, ContactAddr, HostAddr, Protocol},
};

// ─── Identity / address generators ──────────────────────────────────────────

pub fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(|bytes| {
        let secret = libp2p::identity::ed25519::SecretKey::try_from_bytes(bytes)
            .expect("any 32 bytes is a valid ed25519 seed");
        let ed_kp = libp2p::identity::ed25519::Keypair::from(secret);
        let keypair = libp2p::identity::Keypair::from(ed_kp);
        PeerId::from(keypair.public())
    })
}

pub fn arb_ipv4() -> impl Strategy<Value = IpAddr> {
    (1u8..=223, any::<u8>(), any::<u8>(), 1u8..=254)
        .prop_map(|(a, b, c, d)| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

pub fn arb_host_addr() -> impl Strategy<Value = HostAddr> {
    prop_oneof![
        arb_ipv4().prop_map(HostAddr::from),
        any::<[u16; 8]>().prop_map(|s| HostAddr::from(IpAddr::from(s))),
        "[a-z]{1,12}\\.(com|org|net)".prop_map(HostAddr::Domain),
    ]
}

pub fn arb_contact_addr() -> impl Strategy<Value = ContactAddr> {
    (arb_host_addr(), 1u16..=65535).prop_map(|(host, port)| ContactAddr::new(host, port))
}

// ─── Protocol generators ────────────────────────────────────────────────────

pub fn arb_protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![
        Just(Protocol::Tcp),
        Just(Protocol::Udp),
        Just(Protocol::Relay),
    ]
}

pub fn arb_protocol_set() -> impl Strategy<Value = BTreeSet<Protocol>> {
    proptest::collection::btree_set(arb_protocol(), 0..=3)
}

/// A permutation of a random subset of protocols.
pub fn arb_protocol_order() -> impl Strategy<Value = Vec<Protocol>> {
    Just(Protocol::iter().collect::<Vec<_>>())
        .prop_shuffle()
        .prop_flat_map(|all| {
            let len = all.len();
            (Just(all), 0..=len)
        })
        .prop_map(|(all, n)| all.into_iter().take(n).collect())
}

/// Contacts with unique protocols, possibly empty.
pub fn arb_contacts() -> impl Strategy<Value = Vec<Contact>> {
    (arb_protocol_order(), proptest::collection::vec(arb_contact_addr(), 3))
        .prop_map(|(order, addrs)| {
            order
                .into_iter()
                .zip(addrs)
                .map(|(protocol, address)| Contact::new(protocol, address))
                .collect()
        })
}

// ─── State machine generators ───────────────────────────────────────────────

fn arb_generation() -> impl Strategy<Value = u64> {
    0u64..6
}

fn arb_advertise(protocol: Protocol) -> BoxedStrategy<Advertise> {
    match protocol {
        Protocol::Tcp | Protocol::Udp => (1u16..=65535)
            .prop_map(|port| Advertise::External { port })
            .boxed(),
        Protocol::Relay => arb_contact_addr().prop_map(Advertise::Fixed).boxed(),
    }
}

pub fn arb_listening() -> impl Strategy<Value = BTreeMap<Protocol, Advertise>> {
    arb_protocol_set().prop_flat_map(|set| {
        set.into_iter()
            .map(|p| arb_advertise(p).prop_map(move |adv| (p, adv)))
            .collect::<Vec<_>>()
            .prop_map(|pairs| pairs.into_iter().collect::<BTreeMap<_, _>>())
    })
}

pub fn arb_external_address() -> impl Strategy<Value = ExternalAddress> {
    (arb_ipv4(), proptest::option::of(arb_ipv4()), any::<bool>()).prop_map(
        |(external, local, same)| ExternalAddress {
            external,
            local: match same {
                true => Some(external),
                false => local,
            },
        },
    )
}

pub fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![arb_stimulus(), arb_completion()]
}

fn arb_stimulus() -> impl Strategy<Value = Event> {
    let base = Instant::now();
    prop_oneof![
        Just(Event::Init),
        (any::<bool>(), 0u64..2_000).prop_map(move |(long, secs)| Event::Tick {
            cadence: match long {
                true => Cadence::Long,
                false => Cadence::Short,
            },
            now: base + Duration::from_secs(secs),
        }),
        (arb_protocol(), 0u64..2_000).prop_map(move |(protocol, secs)| Event::InboundPacket {
            protocol,
            peer: SocketAddr::from(([198, 51, 100, 7], 7771)),
            at: base + Duration::from_secs(secs),
        }),
        arb_protocol_set().prop_map(|enabled| Event::ConfigChanged { enabled }),
    ]
}

fn arb_completion() -> impl Strategy<Value = Event> {
    prop_oneof![
        (arb_generation(), arb_external_address())
            .prop_map(|(generation, address)| Event::ProbeSucceeded { generation, address }),
        arb_generation().prop_map(|generation| Event::ProbeFailed {
            generation,
            error: ProbeError::Timeout,
        }),
        arb_generation().prop_map(|generation| Event::RetryElapsed { generation }),
        (arb_generation(), arb_listening()).prop_map(|(generation, listening)| {
            Event::ReconcileDone {
                generation,
                report: ReconcileReport {
                    listening,
                    ..ReconcileReport::default()
                },
            }
        }),
        (
            arb_generation(),
            proptest::collection::btree_map(arb_protocol(), 1u16..=65535, 0..=2)
        )
            .prop_map(|(generation, mapped)| Event::PortMappingDone { generation, mapped }),
        any::<bool>().prop_map(|online| Event::ConnectivityChecked { online }),
        (arb_ipv4(), arb_protocol_order())
            .prop_map(|(external, order)| Event::IdentityPublished { external, order }),
    ]
}

/// A fresh machine with a random enabled set and mapping switch.
pub fn arb_reachability_machine() -> impl Strategy<Value = ReachabilityMachine> {
    (
        proptest::collection::btree_set(arb_protocol(), 1..=3),
        any::<bool>(),
    )
        .prop_map(|(enabled, port_mapping)| {
            ReachabilityMachine::new(
                MachineConfig {
                    port_mapping,
                    ..MachineConfig::default()
                },
                enabled,
            )
        })
}
