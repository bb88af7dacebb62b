//! A running registry node.
//!
//! `RegistryNode::start` binds the RPC, admin and gossip listeners,
//! registers the node's own member and spawns every worker under one
//! shared cancellation token.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterBridge;
use crate::config::{NodeConfig, advertised_addr};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::registry::failure_detector::FailureDetector;
use crate::registry::store::MemberStore;
use crate::registry::types::{MemberState, now_ms};
use crate::replication::peer_set::PeerSet;
use crate::server::{admin_router, rpc_router};

pub const REGISTRY_SERVICE: &str = "registry";

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RegistryNode {
    node_id: String,
    store: Arc<MemberStore>,
    peers: Arc<PeerSet>,
    membership: Arc<MembershipService>,
    rpc_addr: SocketAddr,
    advertised_rpc_addr: String,
    admin_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

async fn bind(addr: &str, port: u16, what: &str) -> Result<TcpListener> {
    TcpListener::bind((addr, port))
        .await
        .with_context(|| format!("failed to bind {} listener on {}:{}", what, addr, port))
}

impl RegistryNode {
    pub async fn start(config: NodeConfig) -> Result<Self> {
        if config.node_id.is_empty() {
            anyhow::bail!("node id must not be empty");
        }

        let rpc_listener = bind(&config.rpc.bind_addr, config.rpc.bind_port, "rpc").await?;
        let rpc_addr = rpc_listener.local_addr()?;
        let advertised_rpc_addr =
            advertised_addr(&config.rpc.adv_addr, config.rpc.adv_port, rpc_addr);

        let admin_listener =
            bind(&config.admin.bind_addr, config.admin.bind_port, "admin").await?;
        let admin_addr = admin_listener.local_addr()?;

        let (membership, events) = MembershipService::new(
            NodeId::from(config.node_id.as_str()),
            advertised_rpc_addr.clone(),
            config.gossip.clone(),
        )
        .await?;

        let now = now_ms();
        let mut local = MemberState::new(config.node_id.clone())
            .with_service(REGISTRY_SERVICE)
            .with_status("active")
            .with_revision(env!("CARGO_PKG_VERSION"))
            .with_started(now)
            .with_metadata("rpc_addr", advertised_rpc_addr.clone())
            .with_metadata("admin_addr", admin_addr.to_string())
            .with_metadata("gossip_addr", membership.gossip_addr().to_string());
        if let Some(locality) = config.locality.clone() {
            local = local.with_locality(locality);
        }

        let store = Arc::new(MemberStore::new(local, &config.registry, now));
        let shutdown = CancellationToken::new();
        let peers = PeerSet::new(store.clone(), config.replication.clone(), shutdown.clone())?;
        store.set_observer(peers.clone());

        let mut tasks = Vec::new();

        let rpc_app = rpc_router(store.clone(), shutdown.clone());
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(rpc_listener, rpc_app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!("RPC server failed: {}", e);
            }
        }));

        let admin_app = admin_router(store.clone(), peers.clone());
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!("Admin server failed: {}", e);
            }
        }));

        let detector = FailureDetector::new(store.clone(), config.registry.failure_detector_interval);
        tasks.push(tokio::spawn(detector.run(shutdown.clone())));
        tasks.push(tokio::spawn(peers.clone().run_repair(shutdown.clone())));
        tasks.extend(membership.start(shutdown.clone()));

        let bridge = ClusterBridge::new(store.clone(), peers.clone());
        tasks.push(tokio::spawn(bridge.run(events, shutdown.clone())));

        tasks.push(tokio::spawn(stats_loop(
            store.clone(),
            peers.clone(),
            membership.clone(),
            shutdown.clone(),
        )));

        tracing::info!(
            "Registry node {} started: rpc={} (advertised {}), admin={}, gossip={}",
            config.node_id,
            rpc_addr,
            advertised_rpc_addr,
            admin_addr,
            membership.gossip_addr()
        );

        Ok(Self {
            node_id: config.node_id,
            store,
            peers,
            membership,
            rpc_addr,
            advertised_rpc_addr,
            admin_addr,
            shutdown,
            tasks,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<MemberStore> {
        &self.store
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    /// Bound address of the RPC listener.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// RPC address announced to other registry nodes.
    pub fn advertised_rpc_addr(&self) -> &str {
        &self.advertised_rpc_addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.gossip_addr()
    }

    /// Announces the departure to the cluster, then stops every worker.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down registry node {}", self.node_id);
        self.membership.leave().await;
        self.stop().await;
    }

    /// Stops every worker without telling the cluster, as a crash would.
    pub async fn abort(self) {
        tracing::warn!("Aborting registry node {}", self.node_id);
        self.stop().await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.store.clear_observer();
        self.peers.close();

        let joined = tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(self.tasks)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        tracing::error!("Worker panicked during shutdown: {}", e);
                    }
                }
            }
            Err(_) => tracing::warn!("Workers did not stop within {:?}", STOP_TIMEOUT),
        }

        tracing::info!("Registry node {} stopped", self.node_id);
    }
}

async fn stats_loop(
    store: Arc<MemberStore>,
    peers: Arc<PeerSet>,
    membership: Arc<MembershipService>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let stats = store.stats();
        tracing::info!(
            "Registry stats: {} up, {} down, {} left ({} owned), {} subscribers, {} nodes",
            stats.up,
            stats.down,
            stats.left,
            stats.owned,
            stats.subscribers,
            membership.nodes().len()
        );
        for peer in peers.status() {
            tracing::info!(
                "  - peer {} at {} connected={} pending={} dropped={}",
                peer.node_id,
                peer.addr,
                peer.connected,
                peer.pending,
                peer.dropped
            );
        }
    }
}
