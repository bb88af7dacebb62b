use axum::{
    Json,
    body::Body,
    extract::{
        Extension, Path,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientSyncRequest, ErrorResponse, MembersResponse, NDJSON_CONTENT_TYPE};
use super::session::{SessionStep, WriteSession};
use crate::error::RegistryError;
use crate::registry::filter::Filter;
use crate::registry::store::{MemberStore, StoreStats};
use crate::registry::types::now_ms;
use crate::replication::peer::PeerStatus;
use crate::replication::peer_set::PeerSet;
use crate::replication::protocol::{
    ReplicaSyncRequest, ReplicaSyncResponse, ReplicaUpdateRequest, ReplicaUpdateResponse,
};

// ============================================================
// CLIENT WRITE
// ============================================================

pub async fn handle_client_write(
    ws: WebSocketUpgrade,
    Extension(store): Extension<Arc<MemberStore>>,
    Extension(shutdown): Extension<CancellationToken>,
) -> Response {
    ws.on_upgrade(move |socket| run_write_session(socket, store, shutdown))
}

async fn send_error(socket: &mut WebSocket, err: &ErrorResponse) -> Result<(), axum::Error> {
    let text = serde_json::to_string(err).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

async fn run_write_session(
    mut socket: WebSocket,
    store: Arc<MemberStore>,
    shutdown: CancellationToken,
) {
    let mut session = WriteSession::new(store);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = socket.recv() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let err = RegistryError::Protocol("binary frame is not UTF-8".to_string());
                    let _ = send_error(&mut socket, &ErrorResponse::from(&err)).await;
                    break;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!("Write stream receive failed: {}", e);
                break;
            }
        };

        match session.handle_text(&text, now_ms()) {
            SessionStep::Continue => {}
            SessionStep::Reply(err) => {
                if let Err(e) = send_error(&mut socket, &err).await {
                    tracing::debug!("Failed to send error frame: {}", e);
                    break;
                }
            }
            SessionStep::Close(err) => {
                if let Some(err) = err {
                    let _ = send_error(&mut socket, &err).await;
                }
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    match session.member_id() {
        Some(id) if !session.has_left() => {
            tracing::info!("Write stream for {} closed without LEAVE", id)
        }
        Some(id) => tracing::debug!("Write stream for {} closed", id),
        None => tracing::debug!("Write stream closed before JOIN"),
    }
}

// ============================================================
// CLIENT READ
// ============================================================

/// Streams the catch-up and then live updates as NDJSON, one member per line.
pub async fn handle_client_sync(
    Extension(store): Extension<Arc<MemberStore>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(req): Json<ClientSyncRequest>,
) -> Response {
    let subscription = store.subscribe(&req.digest, req.filter);
    tracing::debug!(
        "Client subscription {} opened (digest of {} ids)",
        subscription.id(),
        req.digest.len()
    );

    let lines = subscription
        .into_stream()
        .map(|member| {
            let mut line = serde_json::to_vec(&member)?;
            line.push(b'\n');
            Ok::<_, serde_json::Error>(line)
        })
        .take_until(shutdown.cancelled_owned());

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response()
}

// ============================================================
// REPLICA
// ============================================================

pub async fn handle_replica_update(
    Extension(store): Extension<Arc<MemberStore>>,
    Json(req): Json<ReplicaUpdateRequest>,
) -> Json<ReplicaUpdateResponse> {
    let source = (!req.source_node_id.is_empty()).then_some(req.source_node_id.as_str());
    let outcome = store.upsert(req.member, source, now_ms());
    Json(ReplicaUpdateResponse {
        applied: outcome.applied,
    })
}

pub async fn handle_replica_sync(
    Extension(store): Extension<Arc<MemberStore>>,
    Json(req): Json<ReplicaSyncRequest>,
) -> Json<ReplicaSyncResponse> {
    let members = store.delta(&req.digest);
    if !members.is_empty() {
        tracing::debug!(
            "Replica sync from {}: returning {} members",
            req.source_node_id,
            members.len()
        );
    }
    Json(ReplicaSyncResponse { members })
}

// ============================================================
// ADMIN
// ============================================================

pub async fn handle_admin_members(
    Extension(store): Extension<Arc<MemberStore>>,
) -> Json<MembersResponse> {
    Json(MembersResponse {
        members: store.list(&Filter::all()),
    })
}

pub async fn handle_admin_member(
    Extension(store): Extension<Arc<MemberStore>>,
    Path(id): Path<String>,
) -> Response {
    match store.get(&id) {
        Some(member) => (StatusCode::OK, Json(member)).into_response(),
        None => {
            let err = RegistryError::NotFound(id);
            (StatusCode::NOT_FOUND, Json(ErrorResponse::from(&err))).into_response()
        }
    }
}

pub async fn handle_admin_peers(Extension(peers): Extension<Arc<PeerSet>>) -> Json<Vec<PeerStatus>> {
    Json(peers.status())
}

pub async fn handle_admin_stats(Extension(store): Extension<Arc<MemberStore>>) -> Json<StoreStats> {
    Json(store.stats())
}
