use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::client::ReplicaClient;
use super::peer::{PeerStatus, ReplicaPeer};
use super::protocol::ReplicaSyncRequest;
use crate::config::ReplicationConfig;
use crate::registry::store::{ApplyObserver, ReplicaStore};
use crate::registry::types::Member;

/// The set of remote registry nodes this node replicates to.
///
/// Pushes every applied write to each peer's queue (except the peer it came
/// from) and runs the anti-entropy repair loop that pulls what the push
/// path lost.
pub struct PeerSet {
    store: Arc<dyn ReplicaStore>,
    client: ReplicaClient,
    peers: DashMap<String, ReplicaPeer>,
    config: ReplicationConfig,
    shutdown: CancellationToken,
}

impl PeerSet {
    pub fn new(
        store: Arc<dyn ReplicaStore>,
        config: ReplicationConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let client = ReplicaClient::new(&config)?;
        Ok(Arc::new(Self {
            store,
            client,
            peers: DashMap::new(),
            config,
            shutdown,
        }))
    }

    /// Starts replicating to a node, seeding its queue with every owned member.
    ///
    /// Re-adding a node at the same address is a no-op; a new address
    /// replaces the existing peer.
    pub fn add_peer(&self, node_id: &str, addr: &str) {
        if node_id == self.store.local_id() {
            return;
        }

        if let Some(existing) = self.peers.get(node_id)
            && existing.addr() == addr
        {
            return;
        }

        let peer = ReplicaPeer::spawn(
            self.store.local_id().to_string(),
            node_id.to_string(),
            addr.to_string(),
            self.client.clone(),
            self.config.queue_capacity,
            &self.shutdown,
        );
        let queue = peer.queue();

        if let Some(replaced) = self.peers.insert(node_id.to_string(), peer) {
            tracing::info!("Replica {} moved from {}", node_id, replaced.addr());
            replaced.close();
        }

        let owned = self.store.owned();
        let seeded = owned.len();
        for member in owned {
            queue.push(member);
        }

        tracing::info!(
            "Added replica peer {} at {} ({} owned members queued)",
            node_id,
            addr,
            seeded
        );
    }

    /// Stops replicating to a node and drops its pending updates.
    pub fn remove_peer(&self, node_id: &str) -> bool {
        match self.peers.remove(node_id) {
            Some((_, peer)) => {
                peer.close();
                tracing::info!("Removed replica peer {}", node_id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.contains_key(node_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        let mut status: Vec<PeerStatus> = self.peers.iter().map(|e| e.value().status()).collect();
        status.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        status
    }

    fn random_peer(&self) -> Option<(String, String)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().addr().to_string()))
            .choose(&mut rand::thread_rng())
    }

    /// One anti-entropy round against a random peer.
    ///
    /// Returns the number of members applied, or `None` when there are no peers.
    pub async fn sync_random(&self) -> Result<Option<usize>> {
        let Some((node_id, addr)) = self.random_peer() else {
            return Ok(None);
        };
        self.sync_with(&node_id, &addr).await.map(Some)
    }

    pub async fn sync_with(&self, node_id: &str, addr: &str) -> Result<usize> {
        let request = ReplicaSyncRequest {
            digest: self.store.digest(self.config.max_digest),
            source_node_id: self.store.local_id().to_string(),
        };

        let response = self
            .client
            .sync(addr, &request)
            .await
            .with_context(|| format!("replica sync with {} failed", node_id))?;

        let received = response.members.len();
        let mut applied = 0;
        for member in response.members {
            if self.store.apply(member, Some(node_id)).applied {
                applied += 1;
            }
        }

        if received > 0 {
            tracing::debug!(
                "Replica sync with {}: {} received, {} applied",
                node_id,
                received,
                applied
            );
        }
        Ok(applied)
    }

    /// Periodic repair loop; runs until `shutdown` is cancelled.
    pub async fn run_repair(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.anti_entropy_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let round = tokio::select! {
                _ = shutdown.cancelled() => break,
                round = self.sync_random() => round,
            };
            if let Err(e) = round {
                tracing::warn!("Anti-entropy round failed: {:#}", e);
            }
        }

        tracing::debug!("Anti-entropy worker stopped");
    }

    pub fn close(&self) {
        let ids = self.peer_ids();
        for id in ids {
            self.remove_peer(&id);
        }
    }
}

impl ApplyObserver for PeerSet {
    fn on_apply(&self, member: &Member, source: Option<&str>) {
        for peer in self.peers.iter() {
            if Some(peer.key().as_str()) == source {
                continue;
            }
            peer.value().enqueue(member.clone());
        }
    }
}
