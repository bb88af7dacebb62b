//! The node-local member map.
//!
//! `MemberStore` keeps one `Member` per id, applying a write only when it
//! carries a strictly greater version. All state lives behind a single
//! mutex and every critical section is a handful of map operations plus
//! the fan-out to the broker and the apply observer. Nothing under the lock
//! performs I/O.

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::broker::{Broker, SubscriberScope, Subscription, SubscriptionId};
use super::filter::Filter;
use super::types::{Digest, Liveness, Member, MemberState, Version};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};

/// Receives every write applied to the store.
///
/// `source` is the node id the write was received from, or `None` for
/// writes that originated locally. Called with the store lock held, so
/// implementations must only enqueue.
pub trait ApplyObserver: Send + Sync {
    fn on_apply(&self, member: &Member, source: Option<&str>);
}

/// The slice of the store that replication depends on.
pub trait ReplicaStore: Send + Sync {
    fn local_id(&self) -> &str;

    /// Applies a member received from `source` if it is strictly newer.
    fn apply(&self, member: Member, source: Option<&str>) -> UpsertOutcome;

    fn digest(&self, max_n: usize) -> Digest;

    fn owned(&self) -> Vec<Member>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub applied: bool,
    pub previous: Option<Member>,
}

impl UpsertOutcome {
    fn rejected() -> Self {
        Self {
            applied: false,
            previous: None,
        }
    }
}

/// Member counts by liveness.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub up: usize,
    pub down: usize,
    pub left: usize,
    pub owned: usize,
    pub subscribers: usize,
}

/// What one failure detector pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub marked_down: Vec<String>,
    pub taken_over: Vec<String>,
    pub expired: Vec<String>,
}

impl LivenessReport {
    pub fn is_empty(&self) -> bool {
        self.marked_down.is_empty() && self.taken_over.is_empty() && self.expired.is_empty()
    }
}

struct Inner {
    members: HashMap<String, Member>,
    /// Last heartbeat of each owned member.
    last_seen: HashMap<String, i64>,
    last_timestamp: i64,
    /// Latest wall-clock time passed to the store, used to hide expired
    /// members between failure detector passes.
    clock: i64,
    /// Registry nodes reported down, with the time they went down.
    down_nodes: HashMap<String, i64>,
    /// Ids a peer holds newer than us, to lead our next digest.
    priority: HashSet<String>,
    broker: Broker,
    observer: Option<Arc<dyn ApplyObserver>>,
}

pub struct MemberStore {
    local_id: String,
    heartbeat_timeout: i64,
    reconnect_timeout: i64,
    tombstone_timeout: i64,
    inner: Mutex<Inner>,
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

impl MemberStore {
    /// Creates a store holding the local node's own member, up and owned.
    pub fn new(local: MemberState, config: &RegistryConfig, now: i64) -> Self {
        let local_id = local.id.clone();
        let version = Version::new(local_id.clone(), now);
        let member = Member {
            state: local,
            liveness: Liveness::Up,
            expiry: 0,
            version,
        };

        let mut members = HashMap::new();
        members.insert(local_id.clone(), member);

        Self {
            local_id,
            heartbeat_timeout: millis(config.heartbeat_timeout),
            reconnect_timeout: millis(config.reconnect_timeout),
            tombstone_timeout: millis(config.tombstone_timeout),
            inner: Mutex::new(Inner {
                members,
                last_seen: HashMap::new(),
                last_timestamp: now,
                clock: now,
                down_nodes: HashMap::new(),
                priority: HashSet::new(),
                broker: Broker::new(config.subscriber_capacity),
                observer: None,
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Installs the observer notified of every applied write.
    pub fn set_observer(&self, observer: Arc<dyn ApplyObserver>) {
        self.inner.lock().observer = Some(observer);
    }

    pub fn clear_observer(&self) {
        self.inner.lock().observer = None;
    }

    // ============================================================
    // REPLICATED WRITES
    // ============================================================

    /// Applies `member` if its version is strictly newer than the stored one
    /// and it has not expired.
    ///
    /// Writes for the local node's own record are refused; only this node
    /// may change it. A newer remote version of it (a peer took this node
    /// over while it was unreachable) makes this node re-issue its record
    /// above that version.
    pub fn upsert(&self, member: Member, source: Option<&str>, now: i64) -> UpsertOutcome {
        if member.id().is_empty() {
            tracing::warn!("Dropping update with empty member id from {:?}", source);
            return UpsertOutcome::rejected();
        }

        let mut inner = self.inner.lock();
        if member.id() == self.local_id {
            self.reassert_local(&mut inner, &member.version, source, now);
            return UpsertOutcome::rejected();
        }
        self.apply_locked(&mut inner, member, source, now)
    }

    fn reassert_local(&self, inner: &mut Inner, seen: &Version, source: Option<&str>, now: i64) {
        let Some(current) = inner.members.get(&self.local_id).cloned() else {
            return;
        };
        if *seen <= current.version {
            return;
        }

        tracing::warn!(
            "Local member {} was overwritten by {} (from {:?}), re-asserting",
            self.local_id,
            seen.owner,
            source
        );
        let version = self.next_version(inner, Some(seen), now);
        let member = Member {
            state: current.state,
            liveness: Liveness::Up,
            expiry: 0,
            version,
        };
        self.apply_locked(inner, member, None, now);
    }

    fn apply_locked(
        &self,
        inner: &mut Inner,
        member: Member,
        source: Option<&str>,
        now: i64,
    ) -> UpsertOutcome {
        inner.clock = inner.clock.max(now);
        let id = member.id().to_string();

        if member.is_expired(now) {
            tracing::debug!("Dropping expired member {} from {:?}", id, source);
            return UpsertOutcome::rejected();
        }
        if let Some(existing) = inner.members.get(&id)
            && member.version <= existing.version
        {
            return UpsertOutcome::rejected();
        }

        let owned = member.version.owner == self.local_id;
        if owned {
            inner.last_seen.insert(id.clone(), now);
        } else {
            inner.last_seen.remove(&id);
        }
        if member.version.timestamp > inner.last_timestamp && owned {
            inner.last_timestamp = member.version.timestamp;
        }

        let previous = inner.members.insert(id, member.clone());
        let lost = previous
            .as_ref()
            .is_some_and(|p| p.version.owner == self.local_id && !owned);

        inner.broker.publish(&member, owned || lost);
        if let Some(observer) = &inner.observer {
            observer.on_apply(&member, source);
        }

        UpsertOutcome {
            applied: true,
            previous,
        }
    }

    /// Next version for a locally originated write.
    fn next_version(&self, inner: &mut Inner, existing: Option<&Version>, now: i64) -> Version {
        let mut timestamp = now.max(inner.last_timestamp + 1);
        if let Some(existing) = existing {
            timestamp = timestamp.max(existing.timestamp + 1);
        }
        inner.last_timestamp = timestamp;
        Version::new(self.local_id.clone(), timestamp)
    }

    fn write_owned(
        &self,
        inner: &mut Inner,
        state: MemberState,
        liveness: Liveness,
        expiry: i64,
        now: i64,
    ) -> Member {
        let existing = inner.members.get(&state.id).map(|m| m.version.clone());
        let version = self.next_version(inner, existing.as_ref(), now);
        let member = Member {
            state,
            liveness,
            expiry,
            version,
        };
        self.apply_locked(inner, member.clone(), None, now);
        member
    }

    fn validate_client_id(&self, id: &str) -> RegistryResult<()> {
        if id.is_empty() {
            return Err(RegistryError::Protocol("member id is empty".to_string()));
        }
        if id == self.local_id {
            return Err(RegistryError::Protocol(format!(
                "member id {} is reserved by the registry node",
                id
            )));
        }
        Ok(())
    }

    // ============================================================
    // OWNER-SIDE OPERATIONS
    // ============================================================

    /// Registers a member owned by this node.
    pub fn join(&self, state: MemberState, now: i64) -> RegistryResult<Member> {
        self.validate_client_id(&state.id)?;

        let mut inner = self.inner.lock();
        let member = self.write_owned(&mut inner, state, Liveness::Up, 0, now);
        tracing::info!("Member {} joined (version {})", member.id(), member.version.timestamp);
        Ok(member)
    }

    /// Records a heartbeat for a member.
    ///
    /// An owned, up member only has its heartbeat time refreshed. Any other
    /// record (down, left, missing or owned elsewhere) is replaced by a new
    /// owned up version.
    pub fn heartbeat(&self, state: &MemberState, now: i64) -> RegistryResult<()> {
        self.validate_client_id(&state.id)?;

        let mut inner = self.inner.lock();
        inner.clock = inner.clock.max(now);
        let current = inner
            .members
            .get(&state.id)
            .filter(|m| !m.is_expired(now))
            .map(|m| (m.version.owner == self.local_id, m.liveness));

        match current {
            Some((true, Liveness::Up)) => {
                inner.last_seen.insert(state.id.clone(), now);
            }
            _ => {
                let member = self.write_owned(&mut inner, state.clone(), Liveness::Up, 0, now);
                tracing::info!("Member {} is up again after heartbeat", member.id());
            }
        }
        Ok(())
    }

    /// Marks a member as left, keeping it as a tombstone until it expires.
    pub fn leave(&self, id: &str, now: i64) -> RegistryResult<Member> {
        self.validate_client_id(id)?;

        let mut inner = self.inner.lock();
        let state = match inner.members.get(id) {
            Some(existing) => existing.state.clone(),
            None => return Err(RegistryError::NotFound(id.to_string())),
        };

        let expiry = now + self.tombstone_timeout;
        let member = self.write_owned(&mut inner, state, Liveness::Left, expiry, now);
        inner.last_seen.remove(id);
        tracing::info!("Member {} left", id);
        Ok(member)
    }

    // ============================================================
    // READS
    // ============================================================

    fn is_visible(&self, inner: &Inner, member: &Member) -> bool {
        member.id() == self.local_id || !member.is_expired(inner.clock)
    }

    pub fn get(&self, id: &str) -> Option<Member> {
        let inner = self.inner.lock();
        inner
            .members
            .get(id)
            .filter(|m| self.is_visible(&inner, m))
            .cloned()
    }

    /// Members matching `filter`, sorted by id.
    pub fn list(&self, filter: &Filter) -> Vec<Member> {
        let inner = self.inner.lock();
        let mut members: Vec<Member> = inner
            .members
            .values()
            .filter(|m| self.is_visible(&inner, m) && filter.matches(m))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.state.id.cmp(&b.state.id));
        members
    }

    pub fn owned(&self) -> Vec<Member> {
        let inner = self.inner.lock();
        inner
            .members
            .values()
            .filter(|m| m.version.owner == self.local_id && self.is_visible(&inner, m))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let mut stats = StoreStats {
            subscribers: inner.broker.len(),
            ..Default::default()
        };
        for member in inner.members.values() {
            match member.liveness {
                Liveness::Up => stats.up += 1,
                Liveness::Down => stats.down += 1,
                Liveness::Left => stats.left += 1,
            }
            if member.version.owner == self.local_id {
                stats.owned += 1;
            }
        }
        stats
    }

    // ============================================================
    // ANTI-ENTROPY
    // ============================================================

    /// A partial snapshot of up to `max_n` ids.
    ///
    /// Ids a peer reported newer than ours come first, with unknown ids at a
    /// zero version. The rest is a uniform random sample.
    pub fn digest(&self, max_n: usize) -> Digest {
        let mut inner = self.inner.lock();
        let mut digest = Digest::new();

        let priority: Vec<String> = inner.priority.drain().collect();
        for id in priority {
            if digest.len() >= max_n {
                break;
            }
            let version = inner
                .members
                .get(&id)
                .map(|m| m.version.clone())
                .unwrap_or_default();
            digest.insert(id, version);
        }

        let remaining = max_n.saturating_sub(digest.len());
        if remaining > 0 {
            let sample = inner
                .members
                .iter()
                .filter(|(id, m)| !digest.contains_key(*id) && self.is_visible(&inner, m))
                .choose_multiple(&mut rand::thread_rng(), remaining);
            let sample: Vec<(String, Version)> = sample
                .into_iter()
                .map(|(id, m)| (id.clone(), m.version.clone()))
                .collect();
            digest.extend(sample);
        }

        digest
    }

    /// Members we hold strictly newer than the digest.
    ///
    /// Ids missing from the digest are not returned, since the digest is
    /// partial. Ids the requester holds newer, or that we do not know, are
    /// queued to lead our next digest. Expired members are neither returned
    /// nor asked for.
    pub fn delta(&self, digest: &Digest) -> Vec<Member> {
        let mut inner = self.inner.lock();
        let clock = inner.clock;
        let mut members = Vec::new();
        let mut wanted = Vec::new();

        for (id, version) in digest {
            match inner.members.get(id) {
                Some(local) if local.id() != self.local_id && local.is_expired(clock) => {}
                Some(local) if local.version > *version => members.push(local.clone()),
                Some(local) if local.version < *version => wanted.push(id.clone()),
                Some(_) => {}
                None => wanted.push(id.clone()),
            }
        }

        inner.priority.extend(wanted);
        members
    }

    /// Removes expired members, except the local node's own record.
    pub fn expire(&self, now: i64) -> Vec<String> {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, now)
    }

    fn expire_locked(&self, inner: &mut Inner, now: i64) -> Vec<String> {
        inner.clock = inner.clock.max(now);
        let expired: Vec<String> = inner
            .members
            .values()
            .filter(|m| m.id() != self.local_id && m.is_expired(now))
            .map(|m| m.state.id.clone())
            .collect();

        for id in &expired {
            inner.members.remove(id);
            inner.last_seen.remove(id);
            tracing::debug!("Member {} expired", id);
        }

        if !expired.is_empty() {
            let Inner {
                members,
                down_nodes,
                ..
            } = inner;
            down_nodes.retain(|node, _| members.values().any(|m| m.version.owner == *node));
        }

        expired
    }

    // ============================================================
    // FAILURE DETECTION
    // ============================================================

    /// Records that a registry node became unreachable at `now`.
    pub fn node_down(&self, node_id: &str, now: i64) {
        if node_id == self.local_id {
            return;
        }
        self.inner
            .lock()
            .down_nodes
            .entry(node_id.to_string())
            .or_insert(now);
    }

    pub fn node_up(&self, node_id: &str) {
        self.inner.lock().down_nodes.remove(node_id);
    }

    pub fn down_nodes(&self) -> Vec<String> {
        self.inner.lock().down_nodes.keys().cloned().collect()
    }

    /// One failure detector pass.
    ///
    /// Owned up members whose heartbeat lapsed are marked down. Remote
    /// members whose owner has been down for at least the heartbeat timeout
    /// are taken over as down. Expired members are then removed.
    pub fn check_liveness(&self, now: i64) -> LivenessReport {
        let mut inner = self.inner.lock();
        let mut report = LivenessReport::default();

        let lapsed: Vec<MemberState> = inner
            .members
            .values()
            .filter(|m| {
                m.id() != self.local_id
                    && m.version.owner == self.local_id
                    && m.liveness == Liveness::Up
            })
            .filter(|m| {
                let last_seen = inner.last_seen.get(m.id()).copied().unwrap_or(now);
                now - last_seen > self.heartbeat_timeout
            })
            .map(|m| m.state.clone())
            .collect();

        for state in lapsed {
            let id = state.id.clone();
            self.write_owned(
                &mut inner,
                state,
                Liveness::Down,
                now + self.reconnect_timeout,
                now,
            );
            tracing::info!("Member {} missed its heartbeats, marked down", id);
            report.marked_down.push(id);
        }

        let orphaned: Vec<MemberState> = inner
            .members
            .values()
            .filter(|m| m.version.owner != self.local_id && m.liveness != Liveness::Left)
            .filter(|m| {
                inner
                    .down_nodes
                    .get(&m.version.owner)
                    .is_some_and(|since| now - since >= self.heartbeat_timeout)
            })
            .map(|m| m.state.clone())
            .collect();

        for state in orphaned {
            let id = state.id.clone();
            self.write_owned(
                &mut inner,
                state,
                Liveness::Down,
                now + self.reconnect_timeout,
                now,
            );
            tracing::info!("Took over member {} from a down node", id);
            report.taken_over.push(id);
        }

        report.expired = self.expire_locked(&mut inner, now);
        report
    }

    // ============================================================
    // SUBSCRIPTIONS
    // ============================================================

    /// Subscribes to owned writes only, or to every applied write.
    pub fn subscribe_local(&self, owned_only: bool) -> Subscription {
        let scope = if owned_only {
            SubscriberScope::Owned
        } else {
            SubscriberScope::All
        };
        self.inner.lock().broker.attach(scope, Vec::new())
    }

    /// Subscribes a client holding `digest` to the members matching `filter`.
    ///
    /// The subscription starts with every matching member the client is
    /// missing or holds an older version of, ordered by version, followed
    /// by live updates.
    ///
    /// Ids the client believes this node owns but this node no longer holds
    /// were removed after their tombstone expired. Those are sent as `left`
    /// at the successor of the client's version, so any real later write
    /// still wins.
    pub fn subscribe(&self, digest: &Digest, filter: Filter) -> Subscription {
        let mut inner = self.inner.lock();

        let mut initial: Vec<Member> = inner
            .members
            .values()
            .filter(|m| self.is_visible(&inner, m) && filter.matches(m))
            .filter(|m| match digest.get(m.id()) {
                Some(version) => m.version > *version,
                None => true,
            })
            .cloned()
            .collect();

        let expiry = inner.clock + self.tombstone_timeout;
        for (id, known) in digest {
            let held = inner
                .members
                .get(id)
                .is_some_and(|m| self.is_visible(&inner, m));
            if held || known.owner != self.local_id {
                continue;
            }
            tracing::debug!("Client holds removed member {}, sending left", id);
            initial.push(Member {
                state: MemberState::new(id.clone()),
                liveness: Liveness::Left,
                expiry,
                version: known.successor(),
            });
        }
        initial.sort_by(|a, b| a.version.cmp(&b.version));

        inner
            .broker
            .attach(SubscriberScope::Filtered(filter), initial)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().broker.detach(id)
    }
}

impl ReplicaStore for MemberStore {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn apply(&self, member: Member, source: Option<&str>) -> UpsertOutcome {
        self.upsert(member, source, super::types::now_ms())
    }

    fn digest(&self, max_n: usize) -> Digest {
        MemberStore::digest(self, max_n)
    }

    fn owned(&self) -> Vec<Member> {
        MemberStore::owned(self)
    }
}
