//! Glue between cluster membership and the member store.
//!
//! Gossip reports registry nodes coming and going; the bridge turns those
//! reports into replication peers and into the owner bookkeeping the
//! failure detector uses for takeover.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::membership::types::NodeEvent;
use crate::registry::store::MemberStore;
use crate::registry::types::now_ms;
use crate::replication::peer_set::PeerSet;

pub struct ClusterBridge {
    store: Arc<MemberStore>,
    peers: Arc<PeerSet>,
}

impl ClusterBridge {
    pub fn new(store: Arc<MemberStore>, peers: Arc<PeerSet>) -> Self {
        Self { store, peers }
    }

    pub fn handle(&self, event: NodeEvent) {
        match event {
            NodeEvent::Joined { id, rpc_addr } => {
                if id.as_str() == self.store.local_id() {
                    return;
                }
                self.store.node_up(id.as_str());
                self.peers.add_peer(id.as_str(), &rpc_addr);
            }
            NodeEvent::Left { id } => {
                if id.as_str() == self.store.local_id() {
                    return;
                }
                self.store.node_down(id.as_str(), now_ms());
                self.peers.remove_peer(id.as_str());
            }
        }
    }

    /// Applies node events until the channel closes or `shutdown` fires.
    pub async fn run(self, mut events: UnboundedReceiver<NodeEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event),
                None => break,
            }
        }
        tracing::debug!("Cluster bridge stopped");
    }
}
