use std::time::Duration;

pub const DEFAULT_TCP_PORT: u16 = 7771;
pub const DEFAULT_UDP_PORT: u16 = 7772;

pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun.cloudflare.com:3478"];

pub const DEFAULT_DISCOVERY_URLS: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me",
    "https://icanhazip.com",
];

pub const DEFAULT_CONNECTIVITY_ENDPOINT: &str = "www.google.com:80";

pub const NODE_KEY_FILE: &str = "node.key";

pub const EVENT_QUEUE_DEPTH: usize = 256;

pub const SHORT_TICK: Duration = Duration::from_secs(60);
pub const LONG_TICK: Duration = Duration::from_secs(600);
pub const TRAFFIC_TIMEOUT: Duration = Duration::from_secs(900);

pub const PROBE_BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub const PROBE_BACKOFF_MAX: Duration = Duration::from_secs(300);

pub const STUN_TIMEOUT: Duration = Duration::from_secs(3);
pub const HTTP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
pub const PORT_MAPPING_TIMEOUT: Duration = Duration::from_secs(5);
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// An inbound tcp connection that sends nothing for this long is closed.
pub const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// UPnP lease requested for each forward. Mappings are renewed on every long
/// tick, so this must stay above `LONG_TICK`.
pub const PORT_MAPPING_LEASE: Duration = Duration::from_secs(3600);

/// Upper bound for a single length-prefixed frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub const PORT_MAPPING_DESCRIPTION: &str = "linkwatch";
