use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    time::{Duration, Instant},
};

use super::{
    backoff::{BackoffConfig, ProbeBackoff},
    command::Command,
    event::{Cadence, Event},
    working::WorkingProtocolSet,
};
use crate::{
    probe::ExternalAddress,
    protocol::TRAFFIC_TIMEOUT,
    traits::MealyMachine,
    transport::Advertise,
    types::{Contact, ContactAddr, DEFAULT_PRIORITY, Protocol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Reachability {
    Startup,
    ProbingHub,
    AwaitingNatConfig,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub traffic_timeout: Duration,
    pub backoff: BackoffConfig,
    pub priority: Vec<Protocol>,
    pub port_mapping: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            traffic_timeout: TRAFFIC_TIMEOUT,
            backoff: BackoffConfig::default(),
            priority: DEFAULT_PRIORITY.to_vec(),
            port_mapping: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MappingStatus {
    NotAttempted,
    InFlight,
    Done(BTreeMap<Protocol, u16>),
    /// Refreshing leases; the previous ports stay advertised meanwhile.
    Renewing(BTreeMap<Protocol, u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub external: IpAddr,
    pub order: Vec<Protocol>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityMachine {
    reachability: Reachability,
    config: MachineConfig,
    enabled: BTreeSet<Protocol>,
    address: Option<ExternalAddress>,
    listening: BTreeMap<Protocol, Advertise>,
    mapping: MappingStatus,
    published: Option<Published>,
    working: WorkingProtocolSet,
    traffic_mark: Option<Instant>,
    network_online: Option<bool>,
    backoff: ProbeBackoff,
    probe_generation: u64,
    retry_generation: u64,
    reconcile_generation: u64,
    reconcile_in_flight: bool,
    mapping_generation: u64,
}

impl ReachabilityMachine {
    pub fn new(config: MachineConfig, enabled: BTreeSet<Protocol>) -> Self {
        Self {
            reachability: Reachability::Startup,
            backoff: ProbeBackoff::new(config.backoff),
            config,
            enabled,
            address: None,
            listening: BTreeMap::new(),
            mapping: MappingStatus::NotAttempted,
            published: None,
            working: WorkingProtocolSet::new(),
            traffic_mark: None,
            network_online: None,
            probe_generation: 0,
            retry_generation: 0,
            reconcile_generation: 0,
            reconcile_in_flight: false,
            mapping_generation: 0,
        }
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    pub fn working(&self) -> &WorkingProtocolSet {
        &self.working
    }

    pub fn enabled(&self) -> &BTreeSet<Protocol> {
        &self.enabled
    }

    pub fn listening(&self) -> &BTreeMap<Protocol, Advertise> {
        &self.listening
    }

    pub fn address(&self) -> Option<ExternalAddress> {
        self.address
    }

    pub fn published(&self) -> Option<&Published> {
        self.published.as_ref()
    }

    pub fn network_online(&self) -> Option<bool> {
        self.network_online
    }

    pub fn probe_failures(&self) -> u32 {
        self.backoff.failures()
    }

    // ─── Derived knowledge ──────────────────────────────────────────────────

    fn behind_nat(&self) -> bool {
        self.address.is_some_and(|a| a.behind_nat())
    }

    fn mapped_port(&self, protocol: Protocol) -> Option<u16> {
        match &self.mapping {
            MappingStatus::Done(mapped) | MappingStatus::Renewing(mapped) => {
                mapped.get(&protocol).copied()
            }
            MappingStatus::NotAttempted | MappingStatus::InFlight => None,
        }
    }

    fn contacts(&self, external: IpAddr) -> Vec<Contact> {
        let behind_nat = self.behind_nat();
        self.listening
            .iter()
            .map(|(&protocol, advertise)| match advertise {
                Advertise::External { port } => {
                    let port = match behind_nat {
                        true => self.mapped_port(protocol).unwrap_or(*port),
                        false => *port,
                    };
                    Contact::new(protocol, ContactAddr::new(external, port))
                }
                Advertise::Fixed(addr) => Contact::new(protocol, addr.clone()),
            })
            .collect()
    }

    fn demoted(&self) -> BTreeSet<Protocol> {
        match (&self.mapping, self.behind_nat()) {
            (MappingStatus::Done(mapped) | MappingStatus::Renewing(mapped), true) => self
                .listening
                .iter()
                .filter(|(p, adv)| {
                    matches!(adv, Advertise::External { .. }) && !mapped.contains_key(*p)
                })
                .map(|(p, _)| *p)
                .collect(),
            (MappingStatus::Done(_) | MappingStatus::Renewing(_), false)
            | (MappingStatus::NotAttempted | MappingStatus::InFlight, _) => BTreeSet::new(),
        }
    }

    fn mappable_ports(&self) -> Vec<(Protocol, u16)> {
        self.listening
            .iter()
            .filter_map(|(p, adv)| match adv {
                Advertise::External { port } => Some((*p, *port)),
                Advertise::Fixed(_) => None,
            })
            .collect()
    }

    /// Every required contact entry is known and published for the current
    /// external address.
    fn settled(&self) -> bool {
        let Some(address) = self.address else {
            return false;
        };
        let Some(published) = &self.published else {
            return false;
        };
        let published_set: BTreeSet<Protocol> = published.order.iter().copied().collect();
        let listening_set: BTreeSet<Protocol> = self.listening.keys().copied().collect();

        !self.reconcile_in_flight
            && !matches!(self.mapping, MappingStatus::InFlight)
            && !listening_set.is_empty()
            && published.external == address.external
            && published_set == listening_set
    }


    // ─── Command builders ───────────────────────────────────────────────────

    fn issue_probe(&mut self, delay: Duration) -> Command {
        self.probe_generation += 1;
        Command::Probe {
            generation: self.probe_generation,
            delay,
        }
    }

    fn issue_reconcile(&mut self) -> Command {
        self.reconcile_generation += 1;
        self.reconcile_in_flight = true;
        Command::Reconcile {
            generation: self.reconcile_generation,
            desired: self.enabled.clone(),
        }
    }

    fn publish_commands(&self) -> Vec<Command> {
        match (self.address, self.listening.is_empty()) {
            (Some(address), false) => vec![Command::PublishIdentity {
                external: address.external,
                contacts: self.contacts(address.external),
                demote: self.demoted(),
            }],
            (Some(_), true) | (None, _) => Vec::new(),
        }
    }

    fn maybe_map_ports(&mut self) -> Vec<Command> {
        let ports = self.mappable_ports();
        match (
            self.config.port_mapping,
            self.behind_nat(),
            &self.mapping,
            ports.is_empty(),
        ) {
            (true, true, MappingStatus::NotAttempted, false) => {
                self.mapping_generation += 1;
                self.mapping = MappingStatus::InFlight;
                vec![Command::MapPorts {
                    generation: self.mapping_generation,
                    ports,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Re-run reconciliation so the supervisor restarts listeners whose task
    /// died; it is a no-op for healthy ones.
    fn recheck_listeners(&mut self) -> Vec<Command> {
        match self.reconcile_in_flight {
            true => Vec::new(),
            false => vec![self.issue_reconcile()],
        }
    }

    /// Gateway mappings expire; request them again while keeping the current
    /// ports published until the answer arrives.
    fn renew_mappings(&mut self) -> Vec<Command> {
        let ports = self.mappable_ports();
        match (&self.mapping, self.config.port_mapping && self.behind_nat(), ports.is_empty()) {
            (MappingStatus::Done(mapped), true, false) => {
                self.mapping_generation += 1;
                self.mapping = MappingStatus::Renewing(mapped.clone());
                vec![Command::MapPorts {
                    generation: self.mapping_generation,
                    ports,
                }]
            }
            (MappingStatus::NotAttempted, _, _) => self.maybe_map_ports(),
            _ => Vec::new(),
        }
    }

    // ─── State entries ──────────────────────────────────────────────────────

    fn enter_awaiting(&mut self) -> Vec<Command> {
        self.reachability = Reachability::AwaitingNatConfig;
        let mut commands = self.publish_commands();
        commands.extend(self.maybe_map_ports());
        commands
    }

    fn enter_connected(&mut self) -> Vec<Command> {
        self.reachability = Reachability::Connected;
        self.traffic_mark = None;
        vec![Command::Announce]
    }

    fn enter_disconnected(&mut self) -> Vec<Command> {
        self.reachability = Reachability::Disconnected;
        self.retry_generation += 1;
        let delay = self.backoff.next_delay();
        vec![
            Command::CheckConnectivity,
            Command::Retry {
                generation: self.retry_generation,
                delay,
            },
        ]
    }

    fn maybe_settle(&mut self) -> Vec<Command> {
        match (self.reachability, self.settled()) {
            (Reachability::AwaitingNatConfig, true) => self.enter_connected(),
            _ => Vec::new(),
        }
    }

    fn traffic_timed_out(&mut self, now: Instant) -> bool {
        let mark = *self.traffic_mark.get_or_insert(now);
        now.saturating_duration_since(mark) >= self.config.traffic_timeout
    }

    // ─── Event handlers ─────────────────────────────────────────────────────

    fn on_probe_succeeded(&mut self, address: ExternalAddress) -> Vec<Command> {
        self.backoff.reset();
        let external_changed = self.address.map(|a| a.external) != Some(address.external);
        if external_changed {
            self.mapping = MappingStatus::NotAttempted;
        }
        self.address = Some(address);

        match self.reachability {
            Reachability::ProbingHub => match self.settled() {
                true => self.enter_connected(),
                false => self.enter_awaiting(),
            },
            Reachability::Connected | Reachability::AwaitingNatConfig => match external_changed {
                true => self.enter_awaiting(),
                false => Vec::new(),
            },
            Reachability::Startup | Reachability::Disconnected => Vec::new(),
        }
    }

    fn on_tick(&mut self, cadence: Cadence, now: Instant) -> Vec<Command> {
        match self.reachability {
            Reachability::Connected => {
                if self.traffic_timed_out(now) {
                    return self.enter_disconnected();
                }
                let mut commands = Vec::new();
                match cadence {
                    Cadence::Short => {
                        let promotion = self.published.as_ref().and_then(|p| {
                            self.working
                                .preferred_promotion(&p.order, &self.config.priority)
                        });
                        if let Some(protocol) = promotion {
                            commands.push(Command::PromoteContact { protocol });
                            commands.push(Command::Announce);
                        }
                        commands.extend(self.recheck_listeners());
                    }
                    Cadence::Long => {
                        commands.push(Command::Announce);
                        commands.push(self.issue_probe(Duration::ZERO));
                        commands.extend(self.renew_mappings());
                    }
                }
                commands
            }
            Reachability::AwaitingNatConfig => match cadence {
                Cadence::Short => self.recheck_listeners(),
                Cadence::Long => Vec::new(),
            },
            Reachability::Startup | Reachability::ProbingHub | Reachability::Disconnected => {
                Vec::new()
            }
        }
    }

    fn on_config_changed(&mut self, enabled: BTreeSet<Protocol>) -> Vec<Command> {
        if enabled == self.enabled {
            return Vec::new();
        }
        self.enabled = enabled;

        match self.reachability {
            Reachability::Startup => Vec::new(),
            Reachability::ProbingHub | Reachability::Disconnected => vec![self.issue_reconcile()],
            Reachability::AwaitingNatConfig | Reachability::Connected => {
                self.reachability = Reachability::AwaitingNatConfig;
                self.mapping = MappingStatus::NotAttempted;
                vec![self.issue_reconcile()]
            }
        }
    }

    fn on_reconcile_done(&mut self, listening: BTreeMap<Protocol, Advertise>) -> Vec<Command> {
        self.reconcile_in_flight = false;
        let changed = listening != self.listening;
        if changed {
            self.mapping = MappingStatus::NotAttempted;
        }
        self.listening = listening;

        match self.reachability {
            Reachability::AwaitingNatConfig => match self.settled() {
                true => self.maybe_settle(),
                false => {
                    let mut commands = self.publish_commands();
                    commands.extend(self.maybe_map_ports());
                    commands
                }
            },
            Reachability::Connected => match changed {
                true => self.enter_awaiting(),
                false => Vec::new(),
            },
            Reachability::Startup | Reachability::ProbingHub | Reachability::Disconnected => {
                Vec::new()
            }
        }
    }

    fn on_port_mapping_done(&mut self, mapped: BTreeMap<Protocol, u16>) -> Vec<Command> {
        self.mapping = MappingStatus::Done(mapped);
        match self.reachability {
            Reachability::AwaitingNatConfig | Reachability::Connected => self.publish_commands(),
            Reachability::Startup | Reachability::ProbingHub | Reachability::Disconnected => {
                Vec::new()
            }
        }
    }
}

impl MealyMachine for ReachabilityMachine {
    type Event = Event;
    type Command = Command;

    fn transition(mut self, event: Event) -> (Self, Vec<Command>) {
        let commands = match event {
            Event::Init => match self.reachability {
                Reachability::Startup => {
                    self.reachability = Reachability::ProbingHub;
                    vec![self.issue_probe(Duration::ZERO), self.issue_reconcile()]
                }
                Reachability::ProbingHub
                | Reachability::AwaitingNatConfig
                | Reachability::Connected
                | Reachability::Disconnected => Vec::new(),
            },

            Event::ProbeSucceeded {
                generation,
                address,
            } => match generation == self.probe_generation {
                true => self.on_probe_succeeded(address),
                false => Vec::new(),
            },

            Event::ProbeFailed { generation, .. } => {
                match (generation == self.probe_generation, self.reachability) {
                    (true, Reachability::ProbingHub) => {
                        let delay = self.backoff.next_delay();
                        vec![self.issue_probe(delay)]
                    }
                    (true, Reachability::Connected) => self.enter_disconnected(),
                    (false, _)
                    | (
                        true,
                        Reachability::Startup
                        | Reachability::AwaitingNatConfig
                        | Reachability::Disconnected,
                    ) => Vec::new(),
                }
            }

            Event::Tick { cadence, now } => self.on_tick(cadence, now),

            Event::InboundPacket { protocol, at, .. } => {
                self.working.insert(protocol);
                self.traffic_mark = Some(at);
                Vec::new()
            }

            Event::ConfigChanged { enabled } => self.on_config_changed(enabled),

            Event::RetryElapsed { generation } => {
                match (generation == self.retry_generation, self.reachability) {
                    (true, Reachability::Disconnected) => {
                        self.reachability = Reachability::ProbingHub;
                        self.working.clear();
                        let mut commands = vec![self.issue_probe(Duration::ZERO)];
                        commands.extend(self.recheck_listeners());
                        commands
                    }
                    (false, _)
                    | (
                        true,
                        Reachability::Startup
                        | Reachability::ProbingHub
                        | Reachability::AwaitingNatConfig
                        | Reachability::Connected,
                    ) => Vec::new(),
                }
            }

            Event::ReconcileDone { generation, report } => {
                match generation == self.reconcile_generation {
                    true => self.on_reconcile_done(report.listening),
                    false => Vec::new(),
                }
            }

            Event::PortMappingDone { generation, mapped } => {
                match (
                    generation == self.mapping_generation,
                    &self.mapping,
                ) {
                    (true, MappingStatus::InFlight | MappingStatus::Renewing(_)) => {
                        self.on_port_mapping_done(mapped)
                    }
                    _ => Vec::new(),
                }
            }

            Event::IdentityPublished { external, order } => {
                self.published = Some(Published { external, order });
                self.maybe_settle()
            }

            Event::ConnectivityChecked { online } => {
                self.network_online = Some(online);
                Vec::new()
            }
        };

        (self, commands)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
