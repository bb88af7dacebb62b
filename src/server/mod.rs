//! RPC and Admin Surfaces
//!
//! Two axum routers, served on separate listeners:
//!
//! - **RPC** (`rpc_router`): client write streams (WebSocket), client read
//!   streams (NDJSON) and the replica endpoints used by other registry nodes.
//! - **Admin** (`admin_router`): read-only member, peer and stats queries.

pub mod handlers;
pub mod protocol;
pub mod session;

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::registry::store::MemberStore;
use crate::replication::peer_set::PeerSet;
use crate::replication::protocol::{ENDPOINT_REPLICA_SYNC, ENDPOINT_REPLICA_UPDATE};
use handlers::*;
use protocol::*;

/// Routes of the RPC listener. Streams end when `shutdown` is cancelled.
pub fn rpc_router(store: Arc<MemberStore>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route(ENDPOINT_CLIENT_WRITE, get(handle_client_write))
        .route(ENDPOINT_CLIENT_SYNC, post(handle_client_sync))
        .route(ENDPOINT_REPLICA_UPDATE, post(handle_replica_update))
        .route(ENDPOINT_REPLICA_SYNC, post(handle_replica_sync))
        .layer(Extension(store))
        .layer(Extension(shutdown))
}

pub fn admin_router(store: Arc<MemberStore>, peers: Arc<PeerSet>) -> Router {
    Router::new()
        .route(ENDPOINT_ADMIN_MEMBERS, get(handle_admin_members))
        .route(ENDPOINT_ADMIN_MEMBER, get(handle_admin_member))
        .route(ENDPOINT_ADMIN_PEERS, get(handle_admin_peers))
        .route(ENDPOINT_ADMIN_STATS, get(handle_admin_stats))
        .layer(Extension(store))
        .layer(Extension(peers))
}
