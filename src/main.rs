use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use linkwatch::{
    announcer::Peer,
    node::NodeConfig,
    protocol::{DEFAULT_CONNECTIVITY_ENDPOINT, DEFAULT_DISCOVERY_URLS, DEFAULT_STUN_SERVERS},
    state::BackoffConfig,
    types::{ContactAddr, Protocol},
};
use tracing_subscriber::EnvFilter;

/// linkwatch: keeps a P2P node reachable.
///
/// Probes the external address, maps ports on the home router, supervises
/// the tcp/udp/relay listeners and announces the resulting contact list.
#[derive(Parser, Debug)]
#[command(name = "linkwatch", version, about)]
struct Cli {
    /// Directory for the node key and the published identity.
    #[arg(long, default_value = ".linkwatch", env = "LINKWATCH_DATA_DIR")]
    data_dir: PathBuf,

    /// Protocols to run: tcp, udp, relay.
    #[arg(long, default_value = "tcp", env = "LINKWATCH_ENABLE", value_delimiter = ',')]
    enable: Vec<Protocol>,

    /// Contact preference when promoting working protocols.
    #[arg(
        long,
        default_value = "tcp,udp,relay",
        env = "LINKWATCH_PRIORITY",
        value_delimiter = ','
    )]
    priority: Vec<Protocol>,

    #[arg(long, default_value = "0.0.0.0:7771", env = "LINKWATCH_TCP_LISTEN")]
    tcp_listen: ContactAddr,

    #[arg(long, default_value = "0.0.0.0:7772", env = "LINKWATCH_UDP_LISTEN")]
    udp_listen: ContactAddr,

    /// Relay server to register with (host:port).
    #[arg(long, env = "LINKWATCH_RELAY")]
    relay: Option<ContactAddr>,

    /// Peers to announce to: [node_id@]proto://host:port
    #[arg(long, env = "LINKWATCH_PEER", value_delimiter = ',')]
    peer: Vec<Peer>,

    /// Directory service URL that receives announcements.
    #[arg(long, env = "LINKWATCH_DIRECTORY")]
    directory: Option<String>,

    /// STUN servers, tried in order.
    #[arg(long, env = "LINKWATCH_STUN_SERVER", value_delimiter = ',')]
    stun_server: Vec<String>,

    /// HTTP "what is my IP" fallbacks.
    #[arg(long, env = "LINKWATCH_DISCOVERY_URL", value_delimiter = ',')]
    discovery_url: Vec<String>,

    #[arg(
        long,
        default_value = DEFAULT_CONNECTIVITY_ENDPOINT,
        env = "LINKWATCH_CONNECTIVITY_ENDPOINT"
    )]
    connectivity_endpoint: String,

    /// Skip UPnP and NAT-PMP/PCP.
    #[arg(long, env = "LINKWATCH_NO_PORT_MAPPING")]
    no_port_mapping: bool,

    #[arg(long, default_value_t = 60, env = "LINKWATCH_SHORT_TICK_SECS")]
    short_tick_secs: u64,

    #[arg(long, default_value_t = 600, env = "LINKWATCH_LONG_TICK_SECS")]
    long_tick_secs: u64,

    /// Silence on every listener for this long means unreachable.
    #[arg(long, default_value_t = 900, env = "LINKWATCH_TRAFFIC_TIMEOUT_SECS")]
    traffic_timeout_secs: u64,

    #[arg(long, default_value_t = 5, env = "LINKWATCH_BACKOFF_INITIAL_SECS")]
    backoff_initial_secs: u64,

    #[arg(long, default_value_t = 300, env = "LINKWATCH_BACKOFF_MAX_SECS")]
    backoff_max_secs: u64,

    /// Failed probes spent at each interval before it doubles.
    #[arg(long, default_value_t = 1, env = "LINKWATCH_FAILURES_PER_STEP")]
    failures_per_step: u32,
}

fn or_defaults(values: Vec<String>, defaults: &[&str]) -> Vec<String> {
    match values.is_empty() {
        true => defaults.iter().map(ToString::to_string).collect(),
        false => values,
    }
}

impl From<Cli> for NodeConfig {
    fn from(cli: Cli) -> Self {
        let mut endpoints = BTreeMap::from([
            (Protocol::Tcp, cli.tcp_listen),
            (Protocol::Udp, cli.udp_listen),
        ]);
        if let Some(relay) = cli.relay {
            endpoints.insert(Protocol::Relay, relay);
        }

        NodeConfig {
            data_dir: cli.data_dir,
            endpoints,
            enabled: cli.enable.into_iter().collect::<BTreeSet<_>>(),
            priority: cli.priority,
            peers: cli.peer,
            directory: cli.directory,
            stun_servers: or_defaults(cli.stun_server, DEFAULT_STUN_SERVERS),
            discovery_urls: or_defaults(cli.discovery_url, DEFAULT_DISCOVERY_URLS),
            connectivity_endpoint: cli.connectivity_endpoint,
            port_mapping: !cli.no_port_mapping,
            short_tick: Duration::from_secs(cli.short_tick_secs),
            long_tick: Duration::from_secs(cli.long_tick_secs),
            traffic_timeout: Duration::from_secs(cli.traffic_timeout_secs),
            backoff: BackoffConfig {
                initial: Duration::from_secs(cli.backoff_initial_secs),
                max: Duration::from_secs(cli.backoff_max_secs),
                failures_per_step: cli.failures_per_step,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    linkwatch::node::run(NodeConfig::from(cli)).await
}
