//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) to track the
//! registry nodes of the cluster. The rest of the node only sees its output: a
//! stream of `NodeEvent::Joined` / `NodeEvent::Left` and the `nodes()` query.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes probe each other over UDP; acks carry the full member list.
//! - **Indirect Probes**: A node that misses acks is probed through helpers (`PingReq`).
//! - **State Sync on Join**: New nodes fetch the member list from a seed over TCP,
//!   falling back to a UDP join.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions driven by silence timeouts.
//! - **Incarnation Numbers**: Order conflicting claims; a node refutes suspicion of
//!   itself by raising its incarnation.

pub mod service;
pub mod types;
