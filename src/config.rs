//! Node configuration.
//!
//! One record per component, each with documented defaults and `with_*`
//! builder methods. `NodeConfig` groups them for a whole registry node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::registry::types::Locality;

pub const DEFAULT_RPC_PORT: u16 = 8110;
pub const DEFAULT_GOSSIP_PORT: u16 = 8111;
pub const DEFAULT_ADMIN_PORT: u16 = 8112;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Member store and failure detector settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// An owned member with no heartbeat for this long is marked down.
    pub heartbeat_timeout: Duration,
    /// How long a down member is kept before it is removed.
    pub reconnect_timeout: Duration,
    /// How long a left member is kept before it is removed.
    pub tombstone_timeout: Duration,
    pub failure_detector_interval: Duration,
    /// Per-subscriber channel capacity before the subscriber is disconnected.
    pub subscriber_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(30),
            tombstone_timeout: Duration::from_secs(30 * 60),
            failure_detector_interval: Duration::from_millis(100),
            subscriber_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_tombstone_timeout(mut self, timeout: Duration) -> Self {
        self.tombstone_timeout = timeout;
        self
    }

    pub fn with_failure_detector_interval(mut self, interval: Duration) -> Self {
        self.failure_detector_interval = interval;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }
}

/// Cluster membership (gossip) settings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    /// Address advertised to other nodes. Empty means the bound address.
    pub adv_addr: String,
    /// Port advertised to other nodes. Zero means the bound port.
    pub adv_port: u16,
    /// Gossip addresses (`host:port`) of existing nodes to join through.
    pub seeds: Vec<String>,
    pub probe_interval: Duration,
    /// Number of helpers asked to probe a node that missed a direct ping.
    pub indirect_checks: usize,
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
    /// Dead node records are forgotten after this long.
    pub reap_timeout: Duration,
    /// Timeout of the TCP state sync with a seed.
    pub join_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            bind_port: DEFAULT_GOSSIP_PORT,
            adv_addr: String::new(),
            adv_port: 0,
            seeds: Vec::new(),
            probe_interval: Duration::from_millis(500),
            indirect_checks: 3,
            suspect_timeout: Duration::from_secs(2),
            dead_timeout: Duration::from_secs(4),
            reap_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(4),
        }
    }
}

impl GossipConfig {
    pub fn with_bind(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.bind_addr = addr.into();
        self.bind_port = port;
        self
    }

    pub fn with_advertise(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.adv_addr = addr.into();
        self.adv_port = port;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_suspect_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_timeout = timeout;
        self
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }
}

/// Listener serving the client and replica RPC surface.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub adv_addr: String,
    pub adv_port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            bind_port: DEFAULT_RPC_PORT,
            adv_addr: String::new(),
            adv_port: 0,
        }
    }
}

impl RpcConfig {
    pub fn with_bind(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.bind_addr = addr.into();
        self.bind_port = port;
        self
    }

    pub fn with_advertise(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.adv_addr = addr.into();
        self.adv_port = port;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub bind_addr: String,
    pub bind_port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            bind_port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl AdminConfig {
    pub fn with_bind(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.bind_addr = addr.into();
        self.bind_port = port;
        self
    }
}

/// Push and anti-entropy settings for the replication peer set.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Hard capacity of each peer's pending update queue.
    pub queue_capacity: usize,
    pub anti_entropy_interval: Duration,
    /// Maximum number of ids in an anti-entropy digest.
    pub max_digest: usize,
    pub connect_attempt_timeout: Duration,
    pub request_timeout: Duration,
    /// Attempts per pushed update before it is dropped.
    pub update_attempts: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            anti_entropy_interval: Duration::from_millis(500),
            max_digest: 10_000,
            connect_attempt_timeout: Duration::from_secs(4),
            request_timeout: Duration::from_secs(2),
            update_attempts: 3,
        }
    }
}

impl ReplicationConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_anti_entropy_interval(mut self, interval: Duration) -> Self {
        self.anti_entropy_interval = interval;
        self
    }

    pub fn with_max_digest(mut self, max: usize) -> Self {
        self.max_digest = max;
        self
    }

    pub fn with_connect_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.connect_attempt_timeout = timeout;
        self
    }

    pub fn with_update_attempts(mut self, attempts: usize) -> Self {
        self.update_attempts = attempts;
        self
    }
}

/// Full configuration of one registry node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Locality reported in the node's own member record.
    pub locality: Option<Locality>,
    pub registry: RegistryConfig,
    pub gossip: GossipConfig,
    pub rpc: RpcConfig,
    pub admin: AdminConfig,
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(generate_node_id())
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            locality: None,
            registry: RegistryConfig::default(),
            gossip: GossipConfig::default(),
            rpc: RpcConfig::default(),
            admin: AdminConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }

    /// Config binding every listener to an ephemeral loopback port.
    pub fn local(node_id: impl Into<String>) -> Self {
        let mut config = Self::new(node_id);
        config.gossip = config.gossip.with_bind("127.0.0.1", 0);
        config.rpc = config.rpc.with_bind("127.0.0.1", 0);
        config.admin = config.admin.with_bind("127.0.0.1", 0);
        config
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_admin(mut self, admin: AdminConfig) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }
}

pub fn generate_node_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("registry-{}", &uuid[..8])
}

/// Resolves the address other nodes should use to reach a bound listener.
///
/// An empty `adv_addr` falls back to the bound IP, with the unspecified
/// address replaced by loopback. A zero `adv_port` falls back to the bound port.
pub fn advertised_addr(adv_addr: &str, adv_port: u16, bound: SocketAddr) -> String {
    let host = if adv_addr.is_empty() {
        let ip = if bound.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            bound.ip()
        };
        ip.to_string()
    } else {
        adv_addr.to_string()
    };
    let port = if adv_port == 0 { bound.port() } else { adv_port };

    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}
