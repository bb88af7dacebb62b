//! Replication Module Tests
//!
//! ## Test Scopes
//! - **PendingUpdates**: Per-id coalescing, capacity eviction and consumer wakeups.
//! - **PeerSet**: Queue seeding, source-skipping fan-out and anti-entropy pulls,
//!   against small in-process HTTP peers.

#[cfg(test)]
mod tests {
    use crate::config::{RegistryConfig, ReplicationConfig};
    use crate::error::ErrorKind;
    use crate::registry::store::MemberStore;
    use crate::registry::types::{Liveness, Member, MemberState, Version, now_ms};
    use crate::replication::client::ReplicaClient;
    use crate::replication::peer_set::PeerSet;
    use crate::replication::protocol::{
        ENDPOINT_REPLICA_SYNC, ENDPOINT_REPLICA_UPDATE, ReplicaSyncRequest, ReplicaSyncResponse,
        ReplicaUpdateRequest, ReplicaUpdateResponse,
    };
    use crate::replication::queue::PendingUpdates;
    use axum::{Json, Router, extract::Extension, routing::post};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    type Received = Arc<Mutex<Vec<ReplicaUpdateRequest>>>;

    fn member(id: &str, owner: &str, timestamp: i64) -> Member {
        Member {
            state: MemberState::new(id).with_service("svc"),
            liveness: Liveness::Up,
            expiry: 0,
            version: Version::new(owner, timestamp),
        }
    }

    async fn record_update(
        Extension(received): Extension<Received>,
        Json(req): Json<ReplicaUpdateRequest>,
    ) -> Json<ReplicaUpdateResponse> {
        received.lock().push(req);
        Json(ReplicaUpdateResponse { applied: true })
    }

    async fn answer_sync(Json(req): Json<ReplicaSyncRequest>) -> Json<ReplicaSyncResponse> {
        let mut members = vec![member("from-peer", "n9", 10_000)];
        // Only return the peer's own member if the requester lacks it
        if req.digest.contains_key("from-peer") {
            members.clear();
        }
        Json(ReplicaSyncResponse { members })
    }

    /// Starts an HTTP peer that records pushed updates and answers syncs.
    async fn spawn_peer() -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(ENDPOINT_REPLICA_UPDATE, post(record_update))
            .route(ENDPOINT_REPLICA_SYNC, post(answer_sync))
            .layer(Extension(received.clone()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, received)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn new_store() -> Arc<MemberStore> {
        Arc::new(MemberStore::new(
            MemberState::new("n1"),
            &RegistryConfig::default(),
            now_ms(),
        ))
    }

    // ============================================================
    // PENDING UPDATES TESTS
    // ============================================================

    #[test]
    fn test_queue_coalesces_per_id() {
        let queue = PendingUpdates::new(10);

        assert!(queue.push(member("m1", "n1", 10)));
        assert!(queue.push(member("m1", "n1", 20)));
        assert!(!queue.push(member("m1", "n1", 15)), "Older version is discarded");
        assert!(queue.push(member("m1", "n1", 20)), "Equal version replaces");

        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_keeps_newest_version() {
        let queue = PendingUpdates::new(10);
        queue.push(member("m1", "n1", 10));
        queue.push(member("m2", "n1", 10));
        queue.push(member("m1", "n1", 30));

        let first = queue.take().await.unwrap();
        assert_eq!(first.state.id, "m1");
        assert_eq!(first.version.timestamp, 30);
        assert_eq!(queue.take().await.unwrap().state.id, "m2");
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = PendingUpdates::new(3);
        for i in 0..5 {
            queue.push(member(&format!("m{}", i), "n1", 10));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.take().await.unwrap().state.id, "m2");
    }

    #[tokio::test]
    async fn test_queue_wakes_waiting_consumer() {
        let queue = Arc::new(PendingUpdates::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(member("m1", "n1", 10));

        let taken = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.unwrap().state.id, "m1");
    }

    #[tokio::test]
    async fn test_queue_close_ends_consumer() {
        let queue = Arc::new(PendingUpdates::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let taken = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(taken.is_none());
        assert!(!queue.push(member("m1", "n1", 10)));
    }

    // ============================================================
    // PEER SET TESTS
    // ============================================================

    #[tokio::test]
    async fn test_add_peer_seeds_owned_members() {
        let store = new_store();
        store.join(MemberState::new("m1"), now_ms()).unwrap();
        let peers =
            PeerSet::new(store.clone(), ReplicationConfig::default(), CancellationToken::new())
                .unwrap();
        let (addr, received) = spawn_peer().await;

        peers.add_peer("n2", &addr);

        assert!(wait_for(|| received.lock().len() >= 2).await);
        let mut ids: Vec<String> = received
            .lock()
            .iter()
            .map(|r| r.member.state.id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["m1".to_string(), "n1".to_string()]);
        assert!(received.lock().iter().all(|r| r.source_node_id == "n1"));

        peers.close();
    }

    #[tokio::test]
    async fn test_push_skips_source_peer() {
        let store = new_store();
        let peers =
            PeerSet::new(store.clone(), ReplicationConfig::default(), CancellationToken::new())
                .unwrap();
        store.set_observer(peers.clone());
        let (addr2, received2) = spawn_peer().await;
        let (addr3, received3) = spawn_peer().await;
        peers.add_peer("n2", &addr2);
        peers.add_peer("n3", &addr3);

        store.upsert(member("m2", "n2", now_ms()), Some("n2"), now_ms());

        let has_m2 = |r: &Received| r.lock().iter().any(|u| u.member.state.id == "m2");
        assert!(wait_for(|| has_m2(&received3)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!has_m2(&received2), "Update echoed back to its source");

        peers.close();
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent_per_address() {
        let store = new_store();
        let peers =
            PeerSet::new(store, ReplicationConfig::default(), CancellationToken::new()).unwrap();
        let (addr, _received) = spawn_peer().await;

        peers.add_peer("n2", &addr);
        peers.add_peer("n2", &addr);
        peers.add_peer("n1", &addr);

        assert_eq!(peers.peer_ids(), vec!["n2".to_string()]);
        assert!(peers.remove_peer("n2"));
        assert!(!peers.remove_peer("n2"));
        assert!(peers.status().is_empty());
    }

    #[tokio::test]
    async fn test_sync_applies_newer_members() {
        let store = new_store();
        let peers =
            PeerSet::new(store.clone(), ReplicationConfig::default(), CancellationToken::new())
                .unwrap();

        assert_eq!(peers.sync_random().await.unwrap(), None);

        let (addr, _received) = spawn_peer().await;
        peers.add_peer("n9", &addr);

        let applied = peers.sync_random().await.unwrap();
        assert_eq!(applied, Some(1));
        assert_eq!(store.get("from-peer").unwrap().version.owner, "n9");

        // Second round: digest now covers it
        assert_eq!(peers.sync_with("n9", &addr).await.unwrap(), 0);

        peers.close();
    }

    #[tokio::test]
    async fn test_failed_push_marks_peer_disconnected() {
        let store = new_store();
        let config = ReplicationConfig::default()
            .with_connect_attempt_timeout(Duration::from_millis(200));
        let peers = PeerSet::new(store, config, CancellationToken::new()).unwrap();

        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        peers.add_peer("n2", &addr);

        assert!(
            wait_for(|| peers.status().first().is_some_and(|s| !s.connected && s.failed > 0))
                .await
        );
        let last_error = peers.status()[0].last_error.clone().unwrap();
        assert!(last_error.starts_with("transport error"), "{}", last_error);
        peers.close();
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        let config = ReplicationConfig::default()
            .with_connect_attempt_timeout(Duration::from_millis(200))
            .with_update_attempts(1);
        let client = ReplicaClient::new(&config).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let request = ReplicaSyncRequest {
            digest: Default::default(),
            source_node_id: "n1".to_string(),
        };
        let err = client.sync(&addr, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let update = ReplicaUpdateRequest {
            member: member("m1", "n1", 10),
            source_node_id: "n1".to_string(),
        };
        let err = client.update(&addr, &update).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
