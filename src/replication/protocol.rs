//! Replica Network Protocol
//!
//! Endpoints and DTOs exchanged between registry nodes. Pushed updates and
//! anti-entropy syncs travel as JSON over HTTP on the RPC listener.

use serde::{Deserialize, Serialize};

use crate::registry::types::{Digest, Member};

// --- API Endpoints ---

/// Push of a single applied member to a peer.
pub const ENDPOINT_REPLICA_UPDATE: &str = "/v1/replica/update";
/// Anti-entropy pull: digest in, newer members out.
pub const ENDPOINT_REPLICA_SYNC: &str = "/v1/replica/sync";

// --- Data Transfer Objects ---

/// Payload of a pushed update.
///
/// `source_node_id` lets the receiver skip echoing the update back to the
/// node it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaUpdateRequest {
    pub member: Member,
    pub source_node_id: String,
}

/// Acknowledgment of a pushed update. `applied` is false for stale versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaUpdateResponse {
    pub applied: bool,
}

/// Anti-entropy probe: a partial `id -> version` snapshot of the requester.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSyncRequest {
    pub digest: Digest,
    #[serde(default)]
    pub source_node_id: String,
}

/// Members the responder holds strictly newer than the probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSyncResponse {
    pub members: Vec<Member>,
}
