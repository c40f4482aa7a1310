//! Connection and cluster configuration.

use std::net::SocketAddr;
use std::time::Duration;

use eventide_wire::framer::DEFAULT_MAX_PACKAGE_SIZE;
use eventide_wire::Credentials;

/// Sentinel for "unlimited" retry or reconnection budgets.
pub const UNLIMITED: i32 = -1;

/// Settings governing a single logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long an operation may wait for its response before a retry (default: 7s).
    pub operation_timeout: Duration,
    /// How often the scheduler sweeps deadlines and heartbeats (default: 1s).
    pub operation_timeout_check_period: Duration,
    /// Retry budget per operation; [`UNLIMITED`] keeps retrying (default: 10).
    pub max_retries: i32,
    /// Reconnection budget per connection; [`UNLIMITED`] keeps reconnecting (default: 10).
    pub max_reconnections: i32,
    /// Pause before each reconnection attempt (default: 100ms).
    pub reconnection_delay: Duration,
    /// Queued-plus-active operations admitted before enqueue fails fast (default: 5000).
    pub max_queue_size: usize,
    /// Operations allowed in flight at once; the rest stay pending (default: 5000).
    pub max_concurrent_items: usize,
    /// Idle time before a heartbeat probe is sent (default: 750ms).
    pub heartbeat_interval: Duration,
    /// Time allowed for any traffic after a probe before the connection is
    /// declared unhealthy (default: 1500ms).
    pub heartbeat_timeout: Duration,
    /// Socket connect timeout (default: 1s).
    pub connection_timeout: Duration,
    /// Bound on a single inbound package's declared length (default: 64 MiB).
    pub max_package_size: usize,
    /// Credentials attached to every package that has none of its own.
    pub default_credentials: Option<Credentials>,
    /// TLS settings; `None` means plain TCP.
    pub tls: Option<TlsSettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(7),
            operation_timeout_check_period: Duration::from_secs(1),
            max_retries: 10,
            max_reconnections: 10,
            reconnection_delay: Duration::from_millis(100),
            max_queue_size: 5000,
            max_concurrent_items: 5000,
            heartbeat_interval: Duration::from_millis(750),
            heartbeat_timeout: Duration::from_millis(1500),
            connection_timeout: Duration::from_secs(1),
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            default_credentials: None,
            tls: None,
        }
    }
}

/// TLS settings for the transport connection.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM-encoded CA certificate(s) used to verify the server.
    pub ca_cert_pem: Vec<u8>,
    /// Expected server name; the target IP or hostname is used when `None`.
    pub server_name: Option<String>,
}

/// Where the cluster discoverer looks for nodes.
#[derive(Debug, Clone)]
pub enum DiscoveryTarget {
    /// A single known node; no gossip involved.
    Single(SocketAddr),
    /// A DNS name resolving to gossip-capable nodes, queried on `gossip_port`.
    ClusterDns {
        /// Cluster DNS name.
        name: String,
        /// External HTTP gossip port on every resolved address.
        gossip_port: u16,
    },
    /// An explicit list of gossip seed endpoints (HTTP).
    GossipSeeds(Vec<SocketAddr>),
}

/// Which node states a discovered endpoint may be drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePreference {
    /// Rank leaders first, then followers, then replicas.
    #[default]
    Leader,
    /// Treat every alive member as equally eligible.
    Any,
}

/// Settings governing gossip-based endpoint discovery.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Where to look for nodes.
    pub target: DiscoveryTarget,
    /// Discovery attempts before failing (default: 10).
    pub max_discover_attempts: u32,
    /// Pause between discovery attempts (default: 500ms).
    pub discover_delay: Duration,
    /// Timeout for a single gossip HTTP request (default: 1s).
    pub gossip_timeout: Duration,
    /// Node-state eligibility and ranking (default: prefer the leader).
    pub node_preference: NodePreference,
    /// Break ties uniformly at random instead of by priority and endpoint (default: false).
    pub prefer_random_node: bool,
}

impl ClusterSettings {
    /// Settings for a single static node.
    pub fn single_node(addr: SocketAddr) -> Self {
        Self::new(DiscoveryTarget::Single(addr))
    }

    /// Settings with explicit gossip seeds.
    pub fn gossip_seeds(seeds: Vec<SocketAddr>) -> Self {
        Self::new(DiscoveryTarget::GossipSeeds(seeds))
    }

    /// Settings discovering via a cluster DNS name.
    pub fn cluster_dns(name: impl Into<String>, gossip_port: u16) -> Self {
        Self::new(DiscoveryTarget::ClusterDns {
            name: name.into(),
            gossip_port,
        })
    }

    fn new(target: DiscoveryTarget) -> Self {
        Self {
            target,
            max_discover_attempts: 10,
            discover_delay: Duration::from_millis(500),
            gossip_timeout: Duration::from_secs(1),
            node_preference: NodePreference::Leader,
            prefer_random_node: false,
        }
    }
}
