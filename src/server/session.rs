//! Per-stream state of a client write session.
//!
//! A session is bound to one member by its first `JOIN`. `HEARTBEAT` and
//! `LEAVE` then apply to that member. The session knows nothing about the
//! transport: the handler feeds it decoded text frames and acts on the
//! returned `SessionStep`.

use std::sync::Arc;

use super::protocol::{ClientUpdate, ErrorResponse};
use crate::error::{ErrorKind, RegistryError};
use crate::registry::store::MemberStore;
use crate::registry::types::MemberState;

/// What the transport should do after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStep {
    Continue,
    /// Send an error frame and keep the stream open.
    Reply(ErrorResponse),
    /// Close the stream, after sending the error frame if there is one.
    Close(Option<ErrorResponse>),
}

pub struct WriteSession {
    store: Arc<MemberStore>,
    state: Option<MemberState>,
    left: bool,
}

impl WriteSession {
    pub fn new(store: Arc<MemberStore>) -> Self {
        Self {
            store,
            state: None,
            left: false,
        }
    }

    /// Id established by the stream's `JOIN`, if any.
    pub fn member_id(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.id.as_str())
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    pub fn handle_text(&mut self, text: &str, now: i64) -> SessionStep {
        match serde_json::from_str::<ClientUpdate>(text) {
            Ok(update) => self.handle(update, now),
            Err(e) => {
                let err = RegistryError::Protocol(format!("malformed frame: {}", e));
                tracing::warn!("Closing write stream: {}", err);
                SessionStep::Close(Some(ErrorResponse::from(&err)))
            }
        }
    }

    pub fn handle(&mut self, update: ClientUpdate, now: i64) -> SessionStep {
        let Some(current) = self.state.clone() else {
            return self.handle_first(update, now);
        };

        match update {
            ClientUpdate::Join { state } => {
                let err = RegistryError::AlreadyRegistered(format!(
                    "stream is bound to {}, ignoring JOIN for {}",
                    current.id, state.id
                ));
                tracing::warn!("{}", err);
                SessionStep::Reply(ErrorResponse::from(&err))
            }
            ClientUpdate::Heartbeat => match self.store.heartbeat(&current, now) {
                Ok(()) => SessionStep::Continue,
                Err(err) => close_with(err),
            },
            ClientUpdate::Leave => {
                self.left = true;
                match self.store.leave(&current.id, now) {
                    Ok(_) => SessionStep::Close(None),
                    Err(err) => close_with(err),
                }
            }
        }
    }

    fn handle_first(&mut self, update: ClientUpdate, now: i64) -> SessionStep {
        match update {
            ClientUpdate::Join { state } => match self.store.join(state.clone(), now) {
                Ok(_) => {
                    self.state = Some(state);
                    SessionStep::Continue
                }
                Err(err) => close_with(err),
            },
            ClientUpdate::Heartbeat => {
                close_with(RegistryError::Protocol("HEARTBEAT before JOIN".to_string()))
            }
            ClientUpdate::Leave => {
                close_with(RegistryError::Protocol("LEAVE before JOIN".to_string()))
            }
        }
    }
}

fn close_with(err: RegistryError) -> SessionStep {
    match err.kind() {
        ErrorKind::Unknown => tracing::error!("Closing write stream: {}", err),
        _ => tracing::warn!("Closing write stream: {}", err),
    }
    SessionStep::Close(Some(ErrorResponse::from(&err)))
}
