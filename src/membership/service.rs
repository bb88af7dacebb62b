use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use rand::seq::{IteratorRandom, SliceRandom};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::types::{GossipMessage, Node, NodeEvent, NodeId, NodeState};
use crate::config::{GossipConfig, advertised_addr};
use crate::registry::types::now_ms;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    incarnation: AtomicU64,
    leaving: AtomicBool,
    /// Nodes waiting for a relayed ack from a target they asked us to probe.
    relays: DashMap<NodeId, Vec<SocketAddr>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    config: GossipConfig,
}

fn is_live(state: NodeState) -> bool {
    state != NodeState::Dead
}

/// Event to report when a node record changes from `was_live` to `node`.
fn transition(was_live: bool, node: &Node, addr_changed: bool) -> Option<NodeEvent> {
    match (was_live, is_live(node.state)) {
        (false, true) => Some(NodeEvent::Joined {
            id: node.id.clone(),
            rpc_addr: node.rpc_addr.clone(),
        }),
        (true, true) if addr_changed => Some(NodeEvent::Joined {
            id: node.id.clone(),
            rpc_addr: node.rpc_addr.clone(),
        }),
        (true, false) => Some(NodeEvent::Left {
            id: node.id.clone(),
        }),
        _ => None,
    }
}

impl MembershipService {
    /// Binds the gossip UDP socket and the TCP join listener on the same port.
    ///
    /// Returns the service and the receiver of node join/leave events.
    pub async fn new(
        node_id: NodeId,
        rpc_addr: String,
        config: GossipConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>)> {
        let socket = UdpSocket::bind((config.bind_addr.as_str(), config.bind_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind gossip socket on {}:{}",
                    config.bind_addr, config.bind_port
                )
            })?;
        let bound = socket.local_addr()?;
        let listener = TcpListener::bind(bound)
            .await
            .with_context(|| format!("failed to bind gossip listener on {}", bound))?;

        let advertised = advertised_addr(&config.adv_addr, config.adv_port, bound);
        let gossip_addr = tokio::net::lookup_host(advertised.as_str())
            .await
            .with_context(|| format!("failed to resolve gossip address {}", advertised))?
            .next()
            .with_context(|| format!("gossip address {} did not resolve", advertised))?;

        // Wall-clock start so a restarted node outranks its previous records.
        let incarnation = now_ms() as u64;
        let local_node = Node {
            id: node_id,
            gossip_addr,
            rpc_addr,
            state: NodeState::Alive,
            incarnation,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let (events, events_rx) = mpsc::unbounded_channel();

        Ok((
            Arc::new(Self {
                local_node,
                members,
                socket: Arc::new(socket),
                listener: parking_lot::Mutex::new(Some(listener)),
                incarnation: AtomicU64::new(incarnation),
                leaving: AtomicBool::new(false),
                relays: DashMap::new(),
                events,
                config,
            }),
            events_rx,
        ))
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.local_node.gossip_addr
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Spawns the background loops and joins the configured seeds.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting membership service for {} on {}",
            self.local_node.id,
            self.local_node.gossip_addr
        );

        let mut handles = vec![
            tokio::spawn(self.clone().gossip_loop(shutdown.clone())),
            tokio::spawn(self.clone().receive_loop(shutdown.clone())),
            tokio::spawn(self.clone().failure_detection_loop(shutdown.clone())),
        ];

        if let Some(listener) = self.listener.lock().take() {
            handles.push(tokio::spawn(self.clone().accept_loop(listener, shutdown.clone())));
        }

        let service = self.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                joined = service.join_seeds() => {
                    if joined == 0 && !service.config.seeds.is_empty() {
                        tracing::warn!("Could not reach any seed node; starting alone");
                    }
                }
            }
        }));

        handles
    }

    /// Targets we are still probing on behalf of another node.
    pub fn pending_relays(&self) -> usize {
        self.relays.len()
    }

    /// Live registry nodes, including the local one.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| is_live(entry.value().state))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    /// Announces a graceful departure to every live node.
    pub async fn leave(&self) {
        self.leaving.store(true, Ordering::SeqCst);
        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };
        self.broadcast_message(msg).await;
        info!("Left the cluster");
    }

    // ============================================================
    // JOIN
    // ============================================================

    async fn join_seeds(&self) -> usize {
        let mut joined = 0;

        for seed in &self.config.seeds {
            let addrs = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::warn!("Failed to resolve seed {}: {}", seed, e);
                    continue;
                }
            };

            for addr in addrs {
                if addr == self.local_node.gossip_addr {
                    continue;
                }
                match self.join_via_tcp(addr).await {
                    Ok(count) => {
                        info!("Joined cluster via {} ({} members known)", addr, count);
                        joined += 1;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("TCP join via {} failed ({:#}), falling back to UDP", addr, e);
                        let msg = GossipMessage::Join {
                            node: self.local_snapshot(),
                        };
                        if let Err(e) = self.send(&msg, addr).await {
                            tracing::warn!("Failed to send join request to {}: {}", addr, e);
                        }
                    }
                }
            }
        }

        joined
    }

    /// Full state sync with a seed: send `Join`, receive its member list.
    async fn join_via_tcp(&self, seed: SocketAddr) -> Result<usize> {
        let timeout = self.config.join_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(seed))
            .await
            .context("connect timed out")?
            .context("connect failed")?;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let join = GossipMessage::Join {
            node: self.local_snapshot(),
        };
        framed.send(Bytes::from(bincode::serialize(&join)?)).await?;

        let frame = tokio::time::timeout(timeout, framed.next())
            .await
            .context("state sync timed out")?
            .context("seed closed the connection")??;

        match bincode::deserialize::<GossipMessage>(&frame)? {
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                let count = members.len();
                self.handle_ack(from, incarnation, members).await?;
                Ok(count)
            }
            other => anyhow::bail!("unexpected reply to join: {:?}", other),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.serve_state_sync(stream).await {
                            tracing::warn!("State sync with {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept gossip connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_state_sync(&self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let frame = tokio::time::timeout(self.config.join_timeout, framed.next())
            .await
            .context("join request timed out")?
            .context("connection closed before join")??;

        match bincode::deserialize::<GossipMessage>(&frame)? {
            GossipMessage::Join { node } => {
                self.handle_join(node).await?;
                let reply = self.ack_message();
                framed.send(Bytes::from(bincode::serialize(&reply)?)).await?;
                Ok(())
            }
            other => anyhow::bail!("unexpected message on join listener: {:?}", other),
        }
    }

    // ============================================================
    // BACKGROUND LOOPS
    // ============================================================

    async fn gossip_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let target = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id && is_live(entry.value().state)
                })
                .map(|entry| entry.value().clone())
                .choose(&mut rand::thread_rng());

            let Some(target) = target else {
                continue;
            };

            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.incarnation(),
            };
            if let Err(e) = self.send(&msg, target.gossip_addr).await {
                tracing::warn!("Failed to send ping to {}: {}", target.id, e);
            } else {
                tracing::debug!("Sent ping to {}", target.id);
            }

            let silent_for = target.last_seen.map(|t| t.elapsed()).unwrap_or_default();
            if silent_for > self.config.probe_interval * 2 {
                self.probe_indirectly(&target).await;
            }
        }
    }

    /// Asks a few other live nodes to ping `target` on our behalf.
    async fn probe_indirectly(&self, target: &Node) {
        let mut helpers: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| {
                let node = entry.value();
                node.id != self.local_node.id
                    && node.id != target.id
                    && node.state == NodeState::Alive
            })
            .map(|entry| entry.value().gossip_addr)
            .collect();
        helpers.shuffle(&mut rand::thread_rng());
        helpers.truncate(self.config.indirect_checks);

        let msg = GossipMessage::PingReq {
            from: self.local_node.id.clone(),
            target: target.id.clone(),
            target_addr: target.gossip_addr,
        };
        for helper in helpers {
            if let Err(e) = self.send(&msg, helper).await {
                tracing::debug!("Failed to send ping request to {}: {}", helper, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; 65536];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn failure_detection_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            for msg in self.detect_failures(Instant::now()) {
                self.broadcast_message(msg).await;
            }
        }
    }

    /// Advances silent nodes through Suspect and Dead, and reaps old dead
    /// records. Returns the messages to broadcast.
    pub(crate) fn detect_failures(&self, now: Instant) -> Vec<GossipMessage> {
        let mut messages = Vec::new();
        let mut events = Vec::new();
        let mut reaped = Vec::new();
        let mut unreachable = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_node.id {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if elapsed > self.config.suspect_timeout => {
                    tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                    member.state = NodeState::Suspect;
                    messages.push(GossipMessage::Suspect {
                        node_id: member.id.clone(),
                        incarnation: member.incarnation,
                    });
                }
                NodeState::Suspect if elapsed > self.config.dead_timeout => {
                    tracing::warn!("Node {} declared dead (no contact for {:?})", member.id, elapsed);
                    member.state = NodeState::Dead;
                    messages.push(GossipMessage::Dead {
                        node_id: member.id.clone(),
                        incarnation: member.incarnation,
                    });
                    events.push(NodeEvent::Left {
                        id: member.id.clone(),
                    });
                    unreachable.push(member.id.clone());
                }
                NodeState::Dead if elapsed > self.config.reap_timeout => {
                    reaped.push(member.id.clone());
                }
                _ => {}
            }
        }

        for id in &reaped {
            self.members
                .remove_if(id, |_, node| node.state == NodeState::Dead);
            tracing::debug!("Forgot dead node {}", id);
        }
        // Nobody will ack for these
        for id in unreachable.iter().chain(reaped.iter()) {
            self.relays.remove(id);
        }
        for event in events {
            self.emit(event);
        }

        messages
    }

    // ============================================================
    // MESSAGE HANDLING
    // ============================================================

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::PingReq {
                from,
                target,
                target_addr,
            } => {
                self.handle_ping_req(from, target, target_addr, src).await?;
            }

            GossipMessage::Join { node } => {
                let reply_to = node.gossip_addr;
                self.handle_join(node).await?;
                self.send(&self.ack_message(), reply_to).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.apply_claim(&node_id, NodeState::Suspect, incarnation)
                    .await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.apply_claim(&node_id, NodeState::Alive, incarnation)
                    .await;
            }

            GossipMessage::Dead {
                node_id,
                incarnation,
            } => {
                self.apply_claim(&node_id, NodeState::Dead, incarnation)
                    .await;
            }

            GossipMessage::Leave {
                node_id,
                incarnation,
            } => {
                info!("Node {} is leaving the cluster", node_id);
                self.apply_claim(&node_id, NodeState::Dead, incarnation)
                    .await;
            }
        }

        Ok(())
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping from {}", from);

        if self.members.contains_key(&from) {
            self.touch(&from, from_incarnation);
        } else {
            tracing::debug!("Ping from unknown node {} at {}", from, src);
        }

        self.send(&self.ack_message(), src).await?;
        Ok(())
    }

    pub(crate) async fn handle_ack(
        &self,
        from: NodeId,
        from_incarnation: u64,
        members: Vec<Node>,
    ) -> Result<()> {
        tracing::debug!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some((_, waiting)) = self.relays.remove(&from) {
            let relayed = GossipMessage::Ack {
                from: from.clone(),
                incarnation: from_incarnation,
                members: members.clone(),
            };
            for addr in waiting {
                self.send(&relayed, addr).await?;
            }
        }

        for member in members {
            self.merge_member(member).await;
        }
        self.touch(&from, from_incarnation);

        Ok(())
    }

    async fn handle_ping_req(
        &self,
        from: NodeId,
        target: NodeId,
        target_addr: SocketAddr,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::debug!("Probing {} on behalf of {}", target, from);

        self.relays.entry(target).or_default().push(src);
        let msg = GossipMessage::Ping {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };
        self.send(&msg, target_addr).await
    }

    pub(crate) async fn handle_join(&self, mut node: Node) -> Result<()> {
        info!("Node {} joining cluster at {}", node.id, node.gossip_addr);

        node.state = NodeState::Alive;
        self.merge_member(node).await;

        info!("Cluster size now: {}", self.nodes().len());
        Ok(())
    }

    /// Direct evidence that `id` is reachable.
    fn touch(&self, id: &NodeId, incarnation: u64) {
        let event = match self.members.get_mut(id) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if incarnation > member.incarnation {
                    let was_live = is_live(member.state);
                    member.incarnation = incarnation;
                    member.state = NodeState::Alive;
                    transition(was_live, &member, false)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Merges a full node record learned from another node.
    pub(crate) async fn merge_member(&self, mut node: Node) {
        if node.id == self.local_node.id {
            if node.state != NodeState::Alive {
                self.refute(node.incarnation).await;
            }
            return;
        }

        let event = match self.members.entry(node.id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if !existing.superseded_by(node.state, node.incarnation) {
                    return;
                }
                tracing::debug!(
                    "Updating {}: inc {} -> {} ({:?})",
                    node.id,
                    existing.incarnation,
                    node.incarnation,
                    node.state
                );
                let was_live = is_live(existing.state);
                let addr_changed = existing.rpc_addr != node.rpc_addr;
                node.last_seen = Some(Instant::now());
                *existing = node;
                transition(was_live, existing, addr_changed)
            }
            Entry::Vacant(entry) => {
                info!("Discovered new member {} at {}", node.id, node.gossip_addr);
                node.last_seen = Some(Instant::now());
                let event = transition(false, &node, false);
                entry.insert(node);
                event
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Applies a state claim about a node we already know.
    async fn apply_claim(&self, node_id: &NodeId, state: NodeState, incarnation: u64) {
        if *node_id == self.local_node.id {
            if state != NodeState::Alive {
                self.refute(incarnation).await;
            }
            return;
        }

        let event = match self.members.get_mut(node_id) {
            Some(mut existing) => {
                if !existing.superseded_by(state, incarnation) {
                    return;
                }
                let was_live = is_live(existing.state);
                existing.state = state;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
                transition(was_live, &existing, false)
            }
            None => {
                tracing::debug!("{:?} claim for unknown node {}", state, node_id);
                None
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Answers a suspicion about ourselves with a higher incarnation.
    async fn refute(&self, claimed: u64) {
        if self.leaving.load(Ordering::SeqCst) {
            return;
        }
        let current = self.incarnation.load(Ordering::SeqCst);
        let refuted = if claimed >= current {
            let next = claimed + 1;
            self.incarnation.store(next, Ordering::SeqCst);
            if let Some(mut local) = self.members.get_mut(&self.local_node.id) {
                local.incarnation = next;
            }
            next
        } else {
            current
        };

        info!("Refuting suspicion with incarnation {}", refuted);
        let msg = GossipMessage::Alive {
            node_id: self.local_node.id.clone(),
            incarnation: refuted,
        };
        self.broadcast_message(msg).await;
    }

    // ============================================================
    // HELPERS
    // ============================================================

    fn local_snapshot(&self) -> Node {
        let mut node = self.local_node.clone();
        node.incarnation = self.incarnation();
        node
    }

    fn ack_message(&self) -> GossipMessage {
        let members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation(),
            members,
        }
    }

    fn emit(&self, event: NodeEvent) {
        match &event {
            NodeEvent::Joined { id, rpc_addr } => info!("Node {} up (rpc={})", id, rpc_addr),
            NodeEvent::Left { id } => info!("Node {} down", id),
        }
        let _ = self.events.send(event);
    }

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let targets: Vec<(NodeId, SocketAddr)> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && is_live(entry.value().state)
            })
            .map(|entry| (entry.key().clone(), entry.value().gossip_addr))
            .collect();

        for (id, addr) in targets {
            if let Err(e) = self.send(&msg, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", id, e);
            }
        }
    }
}
