use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use super::client::ReplicaClient;
use super::protocol::ReplicaUpdateRequest;
use super::queue::PendingUpdates;
use crate::registry::types::Member;

/// Replication status of one peer, as reported by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerStatus {
    pub node_id: String,
    pub addr: String,
    pub connected: bool,
    pub pending: usize,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
    /// Last push failure, cleared once a push succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct PeerCounters {
    connected: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// One remote registry node: its pending queue and the worker draining it.
pub struct ReplicaPeer {
    node_id: String,
    addr: String,
    queue: Arc<PendingUpdates>,
    counters: Arc<PeerCounters>,
    cancel: CancellationToken,
}

impl ReplicaPeer {
    pub fn spawn(
        local_id: String,
        node_id: String,
        addr: String,
        client: ReplicaClient,
        queue_capacity: usize,
        shutdown: &CancellationToken,
    ) -> Self {
        let queue = Arc::new(PendingUpdates::new(queue_capacity));
        let counters = Arc::new(PeerCounters::default());
        counters.connected.store(true, Ordering::Relaxed);
        let cancel = shutdown.child_token();

        tokio::spawn(send_loop(
            local_id,
            node_id.clone(),
            addr.clone(),
            client,
            queue.clone(),
            counters.clone(),
            cancel.clone(),
        ));

        Self {
            node_id,
            addr,
            queue,
            counters,
            cancel,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn queue(&self) -> Arc<PendingUpdates> {
        self.queue.clone()
    }

    pub fn enqueue(&self, member: Member) -> bool {
        self.queue.push(member)
    }

    pub fn is_connected(&self) -> bool {
        self.counters.connected.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            node_id: self.node_id.clone(),
            addr: self.addr.clone(),
            connected: self.is_connected(),
            pending: self.queue.len(),
            dropped: self.queue.dropped(),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            last_error: self.counters.last_error.lock().clone(),
        }
    }

    /// Stops the sender and discards whatever is still queued.
    pub fn close(&self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

async fn send_loop(
    local_id: String,
    node_id: String,
    addr: String,
    client: ReplicaClient,
    queue: Arc<PendingUpdates>,
    counters: Arc<PeerCounters>,
    cancel: CancellationToken,
) {
    tracing::debug!("Replica sender for {} at {} started", node_id, addr);

    loop {
        let member = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.take() => match next {
                Some(member) => member,
                None => break,
            },
        };

        let request = ReplicaUpdateRequest {
            member,
            source_node_id: local_id.clone(),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.update(&addr, &request) => result,
        };

        match result {
            Ok(_) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                counters.last_error.lock().take();
                if !counters.connected.swap(true, Ordering::Relaxed) {
                    tracing::info!("Replica {} reachable again", node_id);
                }
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                *counters.last_error.lock() = Some(e.to_string());
                if counters.connected.swap(false, Ordering::Relaxed) {
                    tracing::warn!("Replica {} disconnected ({}): {}", node_id, e.kind(), e);
                }
                tracing::warn!(
                    "Failed to forward update for {} to {}: {}",
                    request.member.state.id,
                    node_id,
                    e
                );
            }
        }
    }

    tracing::debug!("Replica sender for {} stopped", node_id);
}
