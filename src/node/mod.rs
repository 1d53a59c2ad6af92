mod execute;

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use libp2p::PeerId;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use self::execute::{ExecutionContext, execute_commands};
use crate::{
    announcer::{Announcer, Peer},
    identity,
    probe::{Probe, StunProbe},
    protocol::{
        DEFAULT_CONNECTIVITY_ENDPOINT, DEFAULT_DISCOVERY_URLS, DEFAULT_STUN_SERVERS,
        DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, EVENT_QUEUE_DEPTH, LONG_TICK, NODE_KEY_FILE,
        PORT_MAPPING_LEASE, SHORT_TICK, TRAFFIC_TIMEOUT,
    },
    publisher::IdentityPublisher,
    shutdown,
    state::{BackoffConfig, Cadence, Event, MachineConfig, Reachability, ReachabilityMachine},
    traits::MealyMachine,
    transport::{Inbound, SocketTransports, TransportSupervisor, spawn_supervisor},
    types::{ContactAddr, DEFAULT_PRIORITY, Protocol},
};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub endpoints: BTreeMap<Protocol, ContactAddr>,
    pub enabled: BTreeSet<Protocol>,
    pub priority: Vec<Protocol>,
    pub peers: Vec<Peer>,
    pub directory: Option<String>,
    pub stun_servers: Vec<String>,
    pub discovery_urls: Vec<String>,
    pub connectivity_endpoint: String,
    pub port_mapping: bool,
    pub short_tick: Duration,
    pub long_tick: Duration,
    pub traffic_timeout: Duration,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no protocol is enabled")]
    NothingEnabled,
    #[error("protocol {0} is enabled but has no listen endpoint")]
    MissingEndpoint(Protocol),
    #[error("protocol {0} is enabled but absent from the priority list")]
    MissingPriority(Protocol),
    #[error("protocol {0} appears more than once in the priority list")]
    DuplicatePriority(Protocol),
    #[error("tick intervals must be non-zero")]
    ZeroTick,
    #[error("long tick must be shorter than the port mapping lease so leases are renewed")]
    LeaseOutlivesRenewal,
}

impl NodeConfig {
    /// TCP and UDP on their default ports, relay unconfigured.
    pub fn with_defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            endpoints: BTreeMap::from([
                (
                    Protocol::Tcp,
                    ContactAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TCP_PORT),
                ),
                (
                    Protocol::Udp,
                    ContactAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_UDP_PORT),
                ),
            ]),
            enabled: BTreeSet::from([Protocol::Tcp]),
            priority: DEFAULT_PRIORITY.to_vec(),
            peers: Vec::new(),
            directory: None,
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
            discovery_urls: DEFAULT_DISCOVERY_URLS.iter().map(ToString::to_string).collect(),
            connectivity_endpoint: DEFAULT_CONNECTIVITY_ENDPOINT.to_string(),
            port_mapping: true,
            short_tick: SHORT_TICK,
            long_tick: LONG_TICK,
            traffic_timeout: TRAFFIC_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled.is_empty() {
            return Err(ConfigError::NothingEnabled);
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.priority.iter().find(|p| !seen.insert(**p)) {
            return Err(ConfigError::DuplicatePriority(*dup));
        }
        if let Some(p) = self.enabled.iter().find(|p| !self.endpoints.contains_key(p)) {
            return Err(ConfigError::MissingEndpoint(*p));
        }
        if let Some(p) = self.enabled.iter().find(|p| !self.priority.contains(p)) {
            return Err(ConfigError::MissingPriority(*p));
        }
        if self.short_tick.is_zero() || self.long_tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.port_mapping && self.long_tick >= PORT_MAPPING_LEASE {
            return Err(ConfigError::LeaseOutlivesRenewal);
        }
        Ok(())
    }

    fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            traffic_timeout: self.traffic_timeout,
            backoff: self.backoff,
            priority: self.priority.clone(),
            port_mapping: self.port_mapping,
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

pub struct NodeHandle {
    node_id: PeerId,
    identity_path: PathBuf,
    endpoints: BTreeSet<Protocol>,
    reachability: watch::Receiver<Reachability>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn node_id(&self) -> PeerId {
        self.node_id
    }

    /// Where the published identity is persisted.
    pub fn identity_path(&self) -> &Path {
        &self.identity_path
    }

    pub fn reachability(&self) -> watch::Receiver<Reachability> {
        self.reachability.clone()
    }

    /// Change the enabled protocol set at run time.
    pub async fn set_enabled(&self, enabled: BTreeSet<Protocol>) -> Result<()> {
        if let Some(p) = enabled.iter().find(|p| !self.endpoints.contains(p)) {
            return Err(ConfigError::MissingEndpoint(*p).into());
        }
        self.events
            .send(Event::ConfigChanged { enabled })
            .await
            .context("node event loop has stopped")
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<()> {
        self.task.await.context("node event loop panicked")
    }
}

// ─── Entry points ───────────────────────────────────────────────────────────

/// Start a node with the given probe. Must be called inside a tokio runtime.
pub fn spawn(config: NodeConfig, probe: Arc<dyn Probe>) -> Result<NodeHandle> {
    config.validate().context("invalid node configuration")?;

    let keypair = identity::load_or_generate(&config.data_dir.join(NODE_KEY_FILE))?;
    let node_id = keypair.public().to_peer_id();
    let publisher = IdentityPublisher::open(&config.data_dir, &node_id, config.priority.clone())?;
    let identity_path = publisher.path().to_path_buf();

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(Reachability::Startup);
    let cancel = CancellationToken::new();

    let factory = Arc::new(SocketTransports::new(node_id.to_string(), inbound_tx));
    let supervisor = spawn_supervisor(
        TransportSupervisor::new(factory),
        config.endpoints.clone(),
        events_tx.clone(),
    );
    let announcer = Announcer::new(keypair, config.peers.clone(), config.directory.clone());
    let ctx = ExecutionContext::new(
        events_tx.clone(),
        probe,
        supervisor,
        publisher,
        announcer,
        config.connectivity_endpoint.clone(),
    );
    let machine = ReachabilityMachine::new(config.machine_config(), config.enabled.clone());

    tracing::info!(
        %node_id,
        enabled = ?config.enabled,
        identity = %identity_path.display(),
        "starting linkwatch node"
    );

    let task = tokio::spawn(event_loop(
        machine,
        ctx,
        Channels {
            events: events_rx,
            inbound: inbound_rx,
            state: state_tx,
        },
        Ticks {
            short: config.short_tick,
            long: config.long_tick,
        },
        cancel.clone(),
    ));

    Ok(NodeHandle {
        node_id,
        identity_path,
        endpoints: config.endpoints.keys().copied().collect(),
        reachability: state_rx,
        events: events_tx,
        cancel,
        task,
    })
}

/// Production entry: STUN probing, stops on Ctrl-C or SIGTERM.
pub async fn run(config: NodeConfig) -> Result<()> {
    let probe = StunProbe::new(config.stun_servers.clone(), config.discovery_urls.clone())?;
    let handle = spawn(config, Arc::new(probe))?;

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        tracing::info!("shutdown requested");
        token.cancel();
    });

    handle.join().await
}

// ─── Event loop ─────────────────────────────────────────────────────────────

struct Channels {
    events: mpsc::Receiver<Event>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    state: watch::Sender<Reachability>,
}

struct Ticks {
    short: Duration,
    long: Duration,
}

async fn event_loop(
    mut machine: ReachabilityMachine,
    mut ctx: ExecutionContext,
    mut channels: Channels,
    ticks: Ticks,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now();
    let mut short = tokio::time::interval_at(start + ticks.short, ticks.short);
    let mut long = tokio::time::interval_at(start + ticks.long, ticks.long);
    short.set_missed_tick_behavior(MissedTickBehavior::Delay);
    long.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = VecDeque::from([Event::Init]);

    loop {
        while let Some(event) = pending.pop_front() {
            let old = machine.reachability();
            let event_label = event.to_string();
            let (next, commands) = machine.transition(event);
            tracing::debug!(event = %event_label, commands = commands.len(), "event processed");
            log_reachability_transition(old, &next, commands.len());
            machine = next;
            channels.state.send_if_modified(|current| {
                let changed = *current != machine.reachability();
                *current = machine.reachability();
                changed
            });
            pending.extend(execute_commands(&commands, &mut ctx));
        }

        let event = tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("shutting down");
                break;
            }
            Some(event) = channels.events.recv() => event,
            Some(inbound) = channels.inbound.recv() => {
                tracing::debug!(
                    protocol = %inbound.protocol,
                    peer = %inbound.peer,
                    from = %inbound.announcement.node_id,
                    "inbound announcement"
                );
                Event::InboundPacket {
                    protocol: inbound.protocol,
                    peer: inbound.peer,
                    at: std::time::Instant::now(),
                }
            }
            _ = short.tick() => Event::Tick {
                cadence: Cadence::Short,
                now: std::time::Instant::now(),
            },
            _ = long.tick() => Event::Tick {
                cadence: Cadence::Long,
                now: std::time::Instant::now(),
            },
        };
        pending.push_back(event);
    }

    drop(channels.events);
    ctx.shutdown().await;
}

fn log_reachability_transition(old: Reachability, machine: &ReachabilityMachine, commands: usize) {
    let new = machine.reachability();
    match old == new {
        true => {}
        false => {
            tracing::info!(
                from = %old,
                to = %new,
                commands,
                probe_failures = machine.probe_failures(),
                "reachability transition"
            );
        }
    }
}
