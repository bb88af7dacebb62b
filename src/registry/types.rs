use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where a member runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Locality {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub availability_zone: String,
}

impl Locality {
    pub fn new(region: impl Into<String>, availability_zone: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            availability_zone: availability_zone.into(),
        }
    }
}

/// The state a service instance registers with.
///
/// Only `id` is required; everything else is application-defined and
/// replicated verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberState {
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<Locality>,
    /// Wall-clock ms at member birth.
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl MemberState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    pub fn with_started(mut self, started: i64) -> Self {
        self.started = started;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Logical timestamp of a write, issued by the owning registry node.
///
/// Ordered by `timestamp`, then by `owner` so two nodes issuing the same
/// timestamp still produce a total order, then by `counter`. Owners always
/// issue a zero counter; it only separates a version from its successor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Version {
    pub owner: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub counter: u64,
}

fn is_zero(counter: &u64) -> bool {
    *counter == 0
}

pub type MonotonicTimestamp = Version;

impl Version {
    pub fn new(owner: impl Into<String>, timestamp: i64) -> Self {
        Self {
            owner: owner.into(),
            timestamp,
            counter: 0,
        }
    }

    /// The smallest version newer than `self`. Any version a node issues
    /// later is newer still.
    pub fn successor(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            timestamp: self.timestamp,
            counter: self.counter + 1,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.owner.cmp(&other.owner))
            .then_with(|| self.counter.cmp(&other.counter))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Liveness {
    Up,
    Down,
    Left,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Liveness::Up => "up",
            Liveness::Down => "down",
            Liveness::Left => "left",
        };
        f.write_str(s)
    }
}

/// The replicated unit: a member's state plus the owner's view of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub state: MemberState,
    pub liveness: Liveness,
    /// Absolute expiry in ms, 0 for none.
    pub expiry: i64,
    pub version: Version,
}

impl Member {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn owner(&self) -> &str {
        &self.version.owner
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry != 0 && now >= self.expiry
    }
}

/// Partial map of id to version, used as an anti-entropy probe.
pub type Digest = HashMap<String, Version>;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
