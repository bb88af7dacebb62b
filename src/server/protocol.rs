//! Client and Admin Network Protocol
//!
//! Endpoint paths and DTOs for the client-facing RPC listener and the
//! read-only admin listener. Replica endpoints live in
//! `replication::protocol`.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RegistryError};
use crate::registry::filter::Filter;
use crate::registry::types::{Digest, Member, MemberState};

// --- API Endpoints ---

/// WebSocket upgrade for a member's write stream.
pub const ENDPOINT_CLIENT_WRITE: &str = "/v1/client/write";
/// Digest-seeded subscription, answered as an NDJSON stream of members.
pub const ENDPOINT_CLIENT_SYNC: &str = "/v1/client/sync";

pub const ENDPOINT_ADMIN_MEMBERS: &str = "/v1/admin/members";
pub const ENDPOINT_ADMIN_MEMBER: &str = "/v1/admin/members/:id";
pub const ENDPOINT_ADMIN_PEERS: &str = "/v1/admin/peers";
pub const ENDPOINT_ADMIN_STATS: &str = "/v1/admin/stats";

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

// --- Data Transfer Objects ---

/// One frame of a client write stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientUpdate {
    Join { state: MemberState },
    Heartbeat,
    Leave,
}

/// Request body of a client read stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSyncRequest {
    #[serde(default)]
    pub digest: Digest,
    #[serde(default)]
    pub filter: Filter,
}

/// Error frame on a write stream, or error body of an admin response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub description: String,
}

impl From<&RegistryError> for ErrorResponse {
    fn from(err: &RegistryError) -> Self {
        Self {
            kind: err.kind(),
            description: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

/// Path of one member on the admin surface, with the id percent-encoded
/// as a single segment.
pub fn admin_member_path(id: &str) -> String {
    format!("{}/{}", ENDPOINT_ADMIN_MEMBERS, urlencoding::encode(id))
}
