use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Identity of a registry node. Matches the node's own member id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// Precedence between claims at the same incarnation.
    pub fn rank(self) -> u8 {
        match self {
            NodeState::Alive => 0,
            NodeState::Suspect => 1,
            NodeState::Dead => 2,
        }
    }
}

/// A registry node as seen by the gossip layer.
///
/// `incarnation` orders claims about the node; only the node itself raises
/// it, to refute a suspicion or to announce a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    /// Advertised address of the node's RPC listener.
    pub rpc_addr: String,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    /// Whether a claim `(state, incarnation)` overrides this record.
    pub fn superseded_by(&self, state: NodeState, incarnation: u64) -> bool {
        incarnation > self.incarnation
            || (incarnation == self.incarnation && state.rank() > self.state.rank())
    }
}

/// The wire protocol for inter-node communication.
///
/// - `Ping/Ack`: Direct probes; acks piggyback the sender's member list.
/// - `PingReq`: Asks a helper to probe a target the sender cannot reach.
/// - `Join`: Sent by new nodes to seeds, over TCP or UDP.
/// - `Suspect/Alive/Dead/Leave`: Disseminate changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    PingReq {
        from: NodeId,
        target: NodeId,
        target_addr: SocketAddr,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Dead {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// Cluster change reported to the rest of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Joined { id: NodeId, rpc_addr: String },
    Left { id: NodeId },
}
