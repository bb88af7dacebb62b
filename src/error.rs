//! Error kinds surfaced by the registry façade.
//!
//! `RegistryError` is the internal error type for store and session
//! operations. Its `kind()` is what crosses the wire, so clients only ever
//! see one of the five `ErrorKind` codes.

use serde::{Deserialize, Serialize};

/// Structured error code carried on error responses and error frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed frame or illegal frame ordering on a client stream.
    Protocol,
    /// Lookup of an unknown member.
    NotFound,
    /// A second `JOIN` on a stream that already registered a member.
    AlreadyRegistered,
    /// Peer RPC failure.
    Transport,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("member not found: {0}")]
    NotFound(String),

    #[error("member already registered: {0}")]
    AlreadyRegistered(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Protocol(_) => ErrorKind::Protocol,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            RegistryError::Transport(_) => ErrorKind::Transport,
            RegistryError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
