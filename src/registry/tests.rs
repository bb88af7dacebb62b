//! Registry Module Tests
//!
//! Validates the member store and the components layered on it.
//!
//! ## Test Scopes
//! - **Versions**: Ordering and monotonic issuing of logical timestamps.
//! - **Owner Operations**: Join, heartbeat, leave and their state transitions.
//! - **Failure Detection**: Heartbeat lapse, takeover of orphaned members and expiry.
//! - **Anti-Entropy Primitives**: Digest sampling and delta computation.
//! - **Subscriptions**: Catch-up, filtering and slow-consumer disconnection.

#[cfg(test)]
mod tests {
    use crate::config::RegistryConfig;
    use crate::error::ErrorKind;
    use crate::registry::failure_detector::FailureDetector;
    use crate::registry::filter::Filter;
    use crate::registry::store::{ApplyObserver, MemberStore};
    use crate::registry::types::{Digest, Liveness, Locality, Member, MemberState, Version};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    const T0: i64 = 1_000;

    fn config() -> RegistryConfig {
        RegistryConfig::default()
            .with_heartbeat_timeout(Duration::from_millis(500))
            .with_reconnect_timeout(Duration::from_millis(1_000))
            .with_tombstone_timeout(Duration::from_millis(2_000))
    }

    fn new_store() -> MemberStore {
        MemberStore::new(MemberState::new("n1").with_service("registry"), &config(), T0)
    }

    fn remote(id: &str, owner: &str, timestamp: i64, liveness: Liveness) -> Member {
        Member {
            state: MemberState::new(id).with_service("svc"),
            liveness,
            expiry: if liveness == Liveness::Up { 0 } else { timestamp + 10_000 },
            version: Version::new(owner, timestamp),
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ApplyObserver for RecordingObserver {
        fn on_apply(&self, member: &Member, source: Option<&str>) {
            self.seen
                .lock()
                .push((member.state.id.clone(), source.map(str::to_string)));
        }
    }

    // ============================================================
    // VERSION TESTS
    // ============================================================

    #[test]
    fn test_version_orders_by_timestamp_then_owner() {
        let a = Version::new("n1", 10);
        let b = Version::new("n2", 10);
        let c = Version::new("n1", 11);

        assert!(b > a, "Equal timestamps tie-break on owner");
        assert!(c > b, "Timestamp dominates owner");
        assert_eq!(a, Version::new("n1", 10));
    }

    #[test]
    fn test_successor_sits_below_later_writes() {
        let known = Version::new("n2", 10);
        let next = known.successor();

        assert!(next > known);
        assert!(next < Version::new("n3", 10), "Higher owner at same timestamp still wins");
        assert!(next < Version::new("n1", 11));

        let json = serde_json::to_value(&known).unwrap();
        assert!(json.get("counter").is_none(), "Zero counter stays off the wire");
    }

    #[test]
    fn test_local_member_present_on_creation() {
        let store = new_store();

        let local = store.get("n1").expect("local member missing");
        assert_eq!(local.liveness, Liveness::Up);
        assert_eq!(local.version.owner, "n1");
        assert_eq!(local.expiry, 0);
        assert_eq!(store.owned().len(), 1);
    }

    #[test]
    fn test_issued_versions_are_strictly_increasing() {
        let store = new_store();

        let mut last = store.get("n1").unwrap().version;
        for i in 0..5 {
            // Same wall clock every time
            let member = store
                .join(MemberState::new(format!("m{}", i)), T0)
                .unwrap();
            assert!(member.version > last);
            last = member.version;
        }
    }

    // ============================================================
    // UPSERT TESTS
    // ============================================================

    #[test]
    fn test_upsert_applies_only_newer_versions() {
        let store = new_store();

        let first = store.upsert(remote("m1", "n2", 2_000, Liveness::Up), Some("n2"), T0);
        assert!(first.applied);
        assert!(first.previous.is_none());

        let stale = store.upsert(remote("m1", "n2", 1_500, Liveness::Down), Some("n2"), T0);
        assert!(!stale.applied);

        let equal = store.upsert(remote("m1", "n2", 2_000, Liveness::Down), Some("n2"), T0);
        assert!(!equal.applied, "Equal versions must not be reapplied");

        let newer = store.upsert(remote("m1", "n3", 2_000, Liveness::Down), Some("n3"), T0);
        assert!(newer.applied, "Owner tie-break makes n3 newer");
        assert_eq!(newer.previous.unwrap().version.owner, "n2");
        assert_eq!(store.get("m1").unwrap().liveness, Liveness::Down);
    }

    #[test]
    fn test_upsert_refuses_local_member() {
        let store = new_store();

        let outcome = store.upsert(remote("n1", "n2", 99_999, Liveness::Down), Some("n2"), T0);

        assert!(!outcome.applied);
        let local = store.get("n1").unwrap();
        assert_eq!(local.liveness, Liveness::Up);
        assert_eq!(local.version.owner, "n1");
        assert!(local.version > Version::new("n2", 99_999), "Local record re-asserted");

        // An older copy of our own record changes nothing
        let before = store.get("n1").unwrap().version;
        store.upsert(remote("n1", "n2", 500, Liveness::Down), Some("n2"), T0);
        assert_eq!(store.get("n1").unwrap().version, before);
    }

    #[test]
    fn test_upsert_drops_expired_members() {
        let store = new_store();
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        // Left at 40s with a 10s tombstone, received at 60s
        let stale = remote("m1", "n3", 40_000, Liveness::Left);
        let outcome = store.upsert(stale.clone(), Some("n3"), 60_000);

        assert!(!outcome.applied);
        assert!(store.get("m1").is_none());
        assert!(observer.seen.lock().is_empty(), "Expired members are not fanned out");

        // Same record before its expiry is a normal tombstone
        assert!(store.upsert(stale, Some("n3"), 45_000).applied);
    }

    #[test]
    fn test_expired_members_hidden_before_expiry_pass() {
        let store = new_store();
        store.upsert(remote("m1", "n2", 5_000, Liveness::Left), Some("n2"), T0);
        assert!(store.get("m1").is_some());

        // Another write moves the clock past m1's expiry at 15s
        store.upsert(remote("m2", "n2", 16_000, Liveness::Up), Some("n2"), 20_000);

        assert!(store.get("m1").is_none());
        assert!(store.list(&Filter::all()).iter().all(|m| m.state.id != "m1"));
        assert!(!store.digest(100).contains_key("m1"));

        let mut digest = Digest::new();
        digest.insert("m1".into(), Version::default());
        assert!(store.delta(&digest).is_empty());
        assert!(
            !store.digest(1).contains_key("m1"),
            "Expired ids are not asked for again"
        );
    }

    #[test]
    fn test_observer_sees_source() {
        let store = new_store();
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        store.join(MemberState::new("m1"), T0).unwrap();
        store.upsert(remote("m2", "n2", 5_000, Liveness::Up), Some("n2"), T0);
        store.upsert(remote("m2", "n2", 4_000, Liveness::Up), Some("n2"), T0);

        let seen = observer.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("m1".to_string(), None),
                ("m2".to_string(), Some("n2".to_string())),
            ]
        );
    }

    // ============================================================
    // OWNER OPERATION TESTS
    // ============================================================

    #[test]
    fn test_join_validates_id() {
        let store = new_store();

        let empty = store.join(MemberState::new(""), T0).unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Protocol);

        let local = store.join(MemberState::new("n1"), T0).unwrap_err();
        assert_eq!(local.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_heartbeat_refreshes_without_new_version() {
        let store = new_store();
        let joined = store.join(MemberState::new("m1"), T0).unwrap();

        store.heartbeat(&joined.state, T0 + 300).unwrap();

        let current = store.get("m1").unwrap();
        assert_eq!(current.version, joined.version);

        // The refreshed heartbeat postpones the lapse
        let report = store.check_liveness(T0 + 700);
        assert!(report.marked_down.is_empty());
    }

    #[test]
    fn test_heartbeat_revives_down_member() {
        let store = new_store();
        let joined = store.join(MemberState::new("m1"), T0).unwrap();
        store.check_liveness(T0 + 600);
        let down = store.get("m1").unwrap();
        assert_eq!(down.liveness, Liveness::Down);

        store.heartbeat(&joined.state, T0 + 700).unwrap();

        let up = store.get("m1").unwrap();
        assert_eq!(up.liveness, Liveness::Up);
        assert_eq!(up.expiry, 0);
        assert!(up.version > down.version);
    }

    #[test]
    fn test_heartbeat_reclaims_remote_member() {
        let store = new_store();
        store.upsert(remote("m1", "n2", 50_000, Liveness::Down), Some("n2"), T0);

        store.heartbeat(&MemberState::new("m1"), T0).unwrap();

        let member = store.get("m1").unwrap();
        assert_eq!(member.version.owner, "n1");
        assert_eq!(member.liveness, Liveness::Up);
        assert!(member.version.timestamp > 50_000);
    }

    #[test]
    fn test_leave_tombstones_member() {
        let store = new_store();
        store
            .join(MemberState::new("m1").with_service("svc"), T0)
            .unwrap();

        let left = store.leave("m1", T0 + 100).unwrap();

        assert_eq!(left.liveness, Liveness::Left);
        assert_eq!(left.expiry, T0 + 100 + 2_000);
        assert_eq!(left.state.service, "svc", "Tombstone keeps the state");

        // Tombstone bound
        assert!(store.get("m1").is_some());
        store.expire(T0 + 2_099);
        assert!(store.get("m1").is_some());
        store.expire(T0 + 2_100);
        assert!(store.get("m1").is_none());
    }

    #[test]
    fn test_leave_unknown_member() {
        let store = new_store();

        let err = store.leave("ghost", T0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    // ============================================================
    // FAILURE DETECTION TESTS
    // ============================================================

    #[test]
    fn test_missed_heartbeats_then_expiry() {
        let store = new_store();
        store.join(MemberState::new("m1"), T0).unwrap();

        assert!(store.check_liveness(T0 + 500).is_empty());

        let report = store.check_liveness(T0 + 501);
        assert_eq!(report.marked_down, vec!["m1".to_string()]);
        let down = store.get("m1").unwrap();
        assert_eq!(down.liveness, Liveness::Down);
        assert_eq!(down.expiry, T0 + 501 + 1_000);

        let report = store.check_liveness(T0 + 1_501);
        assert_eq!(report.expired, vec!["m1".to_string()]);
        assert!(store.get("m1").is_none());
    }

    #[test]
    fn test_local_member_never_demoted_or_expired() {
        let store = new_store();

        store.check_liveness(T0 + 1_000_000);

        let local = store.get("n1").unwrap();
        assert_eq!(local.liveness, Liveness::Up);
    }

    #[test]
    fn test_takeover_after_owner_down() {
        let store = new_store();
        store.upsert(remote("m1", "n2", 5_000, Liveness::Up), Some("n2"), T0);
        store.node_down("n2", T0);

        let early = store.check_liveness(T0 + 499);
        assert!(early.taken_over.is_empty());

        let report = store.check_liveness(T0 + 500);
        assert_eq!(report.taken_over, vec!["m1".to_string()]);

        let member = store.get("m1").unwrap();
        assert_eq!(member.version.owner, "n1");
        assert_eq!(member.liveness, Liveness::Down);
        assert_eq!(member.expiry, T0 + 500 + 1_000);
        assert!(member.version.timestamp > 5_000);

        // Owned now, so a second pass leaves it alone
        let again = store.check_liveness(T0 + 600);
        assert!(again.taken_over.is_empty());
    }

    #[test]
    fn test_takeover_skips_left_and_recovered_nodes() {
        let store = new_store();
        store.upsert(remote("gone", "n2", 5_000, Liveness::Left), Some("n2"), T0);
        store.upsert(remote("m3", "n3", 5_000, Liveness::Up), Some("n3"), T0);
        store.node_down("n2", T0);
        store.node_down("n3", T0);
        store.node_up("n3");

        let report = store.check_liveness(T0 + 500);

        assert!(report.taken_over.is_empty());
        assert_eq!(store.get("gone").unwrap().version.owner, "n2");
        assert_eq!(store.get("m3").unwrap().version.owner, "n3");
    }

    #[test]
    fn test_node_reclaims_own_record_after_takeover() {
        let cfg = config();
        let n1 = MemberStore::new(MemberState::new("n1").with_service("registry"), &cfg, T0);
        let n2 = MemberStore::new(MemberState::new("n2").with_service("registry"), &cfg, T0);
        for member in n1.owned() {
            n2.upsert(member, Some("n1"), T0);
        }

        // n2 wrongly believes n1 crashed and takes its record over
        n2.node_down("n1", T0);
        let report = n2.check_liveness(T0 + 500);
        assert_eq!(report.taken_over, vec!["n1".to_string()]);

        // n1 comes back: the seed push is older and loses
        n2.node_up("n1");
        for member in n1.owned() {
            assert!(!n2.upsert(member, Some("n1"), T0 + 600).applied);
        }

        for _ in 0..2 {
            for member in n1.delta(&n2.digest(100)) {
                n2.upsert(member, Some("n1"), T0 + 600);
            }
            for member in n2.delta(&n1.digest(100)) {
                n1.upsert(member, Some("n2"), T0 + 600);
            }
        }

        let on_n1 = n1.get("n1").unwrap();
        let on_n2 = n2.get("n1").unwrap();
        assert_eq!(on_n1, on_n2);
        assert_eq!(on_n1.version.owner, "n1");
        assert_eq!(on_n1.liveness, Liveness::Up);
        assert_eq!(on_n1.expiry, 0);
    }

    #[test]
    fn test_failure_detector_check() {
        let store = Arc::new(new_store());
        store.join(MemberState::new("m1"), T0).unwrap();
        let detector = FailureDetector::new(store.clone(), Duration::from_millis(100));

        let report = detector.check(T0 + 1_000);

        assert_eq!(report.marked_down, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_detector_stops_on_shutdown() {
        let store = Arc::new(new_store());
        let detector = FailureDetector::new(store, Duration::from_millis(10));
        let shutdown = tokio_util::sync::CancellationToken::new();

        let handle = tokio::spawn(detector.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("detector did not stop")
            .unwrap();
    }

    // ============================================================
    // DIGEST & DELTA TESTS
    // ============================================================

    #[test]
    fn test_digest_is_bounded() {
        let store = new_store();
        for i in 0..50 {
            store.join(MemberState::new(format!("m{}", i)), T0).unwrap();
        }

        assert_eq!(store.digest(10).len(), 10);
        assert_eq!(store.digest(10_000).len(), 51);
    }

    #[test]
    fn test_delta_returns_only_newer_members() {
        let store = new_store();
        store.upsert(remote("a", "n2", 2_000, Liveness::Up), Some("n2"), T0);
        store.upsert(remote("b", "n2", 2_000, Liveness::Up), Some("n2"), T0);
        store.upsert(remote("c", "n2", 2_000, Liveness::Up), Some("n2"), T0);

        let mut digest = Digest::new();
        digest.insert("a".into(), Version::new("n2", 1_000)); // we are newer
        digest.insert("b".into(), Version::new("n2", 2_000)); // equal
        digest.insert("c".into(), Version::new("n2", 3_000)); // they are newer
        // "n1" is missing from the digest and must not be returned

        let delta = store.delta(&digest);

        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].state.id, "a");
    }

    #[test]
    fn test_delta_prioritizes_missing_ids_in_next_digest() {
        let store = new_store();
        store.upsert(remote("c", "n2", 2_000, Liveness::Up), Some("n2"), T0);

        let mut digest = Digest::new();
        digest.insert("c".into(), Version::new("n2", 3_000));
        digest.insert("unknown".into(), Version::new("n2", 3_000));
        store.delta(&digest);

        let next = store.digest(2);
        assert_eq!(next.get("c"), Some(&Version::new("n2", 2_000)));
        assert_eq!(next.get("unknown"), Some(&Version::default()));

        // Priority is consumed once
        let after = store.digest(10);
        assert!(!after.contains_key("unknown"));
    }

    #[test]
    fn test_anti_entropy_converges_two_stores() {
        let cfg = config();
        let n1 = MemberStore::new(MemberState::new("n1"), &cfg, T0);
        let n2 = MemberStore::new(MemberState::new("n2"), &cfg, T0);

        for i in 0..200 {
            let member = n1.join(MemberState::new(format!("m{}", i)), T0).unwrap();
            // Half of the pushes are lost
            if i % 2 == 0 {
                n2.upsert(member, Some("n1"), T0);
            }
        }

        for _ in 0..3 {
            // n1 probes n2 first, which flags the ids n2 lacks
            n2.delta(&n1.digest(10_000));
            for member in n1.delta(&n2.digest(10_000)) {
                n2.upsert(member, Some("n1"), T0);
            }
        }

        for i in 0..200 {
            let id = format!("m{}", i);
            assert_eq!(n1.get(&id), n2.get(&id), "{} diverged", id);
        }
    }

    // ============================================================
    // SUBSCRIPTION TESTS
    // ============================================================

    #[test]
    fn test_client_subscribe_catch_up_order() {
        let store = new_store();
        store
            .join(MemberState::new("m1").with_service("svc").with_started(100), T0)
            .unwrap();

        let mut sub = store.subscribe(&Digest::new(), Filter::all());

        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert_eq!(first.state.id, "n1");
        assert_eq!(second.state.id, "m1");
        assert_eq!(second.state.service, "svc");
        assert_eq!(second.liveness, Liveness::Up);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_resubscribe_with_held_digest_is_empty() {
        let store = new_store();
        store.join(MemberState::new("m1"), T0).unwrap();
        store.join(MemberState::new("m2"), T0).unwrap();

        let held: Digest = store
            .list(&Filter::all())
            .into_iter()
            .map(|m| (m.state.id.clone(), m.version))
            .collect();

        let mut sub = store.subscribe(&held, Filter::all());
        assert!(sub.try_recv().is_none());

        store.join(MemberState::new("m3"), T0).unwrap();
        assert_eq!(sub.try_recv().unwrap().state.id, "m3");
    }

    #[test]
    fn test_resubscribe_learns_removed_members_left() {
        let store = new_store();
        store.join(MemberState::new("m1"), T0).unwrap();
        let held_m1 = store.leave("m1", T0 + 100).unwrap().version;
        let held: Digest = [
            ("n1".to_string(), store.get("n1").unwrap().version),
            ("m1".to_string(), held_m1.clone()),
            // Owned elsewhere, may just not have arrived yet
            ("m9".to_string(), Version::new("n2", 500)),
        ]
        .into_iter()
        .collect();

        let report = store.check_liveness(T0 + 100 + 2_000);
        assert_eq!(report.expired, vec!["m1".to_string()]);

        let mut sub = store.subscribe(&held, Filter::all());

        let left = sub.try_recv().unwrap();
        assert_eq!(left.state.id, "m1");
        assert_eq!(left.liveness, Liveness::Left);
        assert_eq!(left.version, held_m1.successor());
        assert!(sub.try_recv().is_none());

        // A real rejoin is newer than the synthesized left
        let rejoined = store.join(MemberState::new("m1"), T0 + 3_000).unwrap();
        assert!(rejoined.version > left.version);
        assert_eq!(sub.try_recv().unwrap().version, rejoined.version);
    }

    #[test]
    fn test_filtered_subscription_elides_non_matching() {
        let store = new_store();
        let eu = Locality::new("eu-west-1", "eu-west-1a");
        store
            .join(
                MemberState::new("a").with_service("api").with_locality(eu.clone()),
                T0,
            )
            .unwrap();
        store
            .join(MemberState::new("b").with_service("db").with_locality(eu), T0)
            .unwrap();
        store
            .join(MemberState::new("c").with_service("api"), T0)
            .unwrap();

        let filter = Filter::all().with_service("api").with_region("eu-west-1");
        let mut sub = store.subscribe(&Digest::new(), filter.clone());

        let mut received = Vec::new();
        while let Some(member) = sub.try_recv() {
            assert!(filter.matches(&member));
            received.push(member.state.id);
        }
        assert_eq!(received, vec!["a".to_string()]);

        store
            .join(MemberState::new("d").with_service("db"), T0)
            .unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_owned_only_subscription() {
        let store = new_store();
        let mut sub = store.subscribe_local(true);

        store.join(MemberState::new("m1"), T0).unwrap();
        store.upsert(remote("m2", "n2", 5_000, Liveness::Up), Some("n2"), T0);
        // n2 takes m1 away from us
        store.upsert(remote("m1", "n2", 9_000, Liveness::Up), Some("n2"), T0);

        assert_eq!(sub.try_recv().unwrap().version.owner, "n1");
        let lost = sub.try_recv().unwrap();
        assert_eq!(lost.state.id, "m1");
        assert_eq!(lost.version.owner, "n2");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_slow_subscriber_disconnected() {
        let store = MemberStore::new(
            MemberState::new("n1"),
            &config().with_subscriber_capacity(2),
            T0,
        );
        let mut sub = store.subscribe_local(false);
        assert_eq!(store.stats().subscribers, 1);

        for i in 0..3 {
            store.join(MemberState::new(format!("m{}", i)), T0).unwrap();
        }

        assert_eq!(store.stats().subscribers, 0);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let store = new_store();
        let sub = store.subscribe_local(false);

        assert!(store.unsubscribe(sub.id()));
        assert!(!store.unsubscribe(sub.id()));
    }

    // ============================================================
    // FILTER & STATS TESTS
    // ============================================================

    #[test]
    fn test_filter_requires_locality_when_set() {
        let state = MemberState::new("m1").with_service("svc");

        assert!(Filter::all().matches_state(&state));
        assert!(Filter::all().with_service("svc").matches_state(&state));
        assert!(!Filter::all().with_region("us-east-1").matches_state(&state));

        let located = state.with_locality(Locality::new("us-east-1", "us-east-1b"));
        assert!(Filter::all()
            .with_availability_zone("us-east-1b")
            .matches_state(&located));
        assert!(!Filter::all()
            .with_availability_zone("us-east-1a")
            .matches_state(&located));
    }

    #[test]
    fn test_stats_counts_liveness() {
        let store = new_store();
        store.join(MemberState::new("m1"), T0).unwrap();
        store.join(MemberState::new("m2"), T0).unwrap();
        store.leave("m2", T0).unwrap();
        store.upsert(remote("m3", "n2", 5_000, Liveness::Down), Some("n2"), T0);

        let stats = store.stats();
        assert_eq!(stats.up, 2);
        assert_eq!(stats.left, 1);
        assert_eq!(stats.down, 1);
        assert_eq!(stats.owned, 3);
    }

    #[test]
    fn test_member_wire_format() {
        let member = remote("m1", "n2", 42, Liveness::Up);

        let json = serde_json::to_value(&member).unwrap();

        assert_eq!(json["liveness"], "UP");
        assert_eq!(json["version"]["owner"], "n2");
        assert_eq!(json["version"]["timestamp"], 42);
        assert_eq!(json["state"]["id"], "m1");
    }
}
