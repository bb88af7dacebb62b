//! Replication Module
//!
//! Moves member updates between registry nodes.
//!
//! ## Core Mechanisms
//! - **Push**: Every write applied to the local store is queued for each peer and
//!   sent by a per-peer worker (`Replica.Update`).
//! - **Pull (anti-entropy)**: On a fixed interval a random peer is sent a digest of
//!   the local store and answers with anything newer (`Replica.Sync`).
//! - **Coalescing queues**: A peer queue keeps only the newest pending version per
//!   member and drops the oldest entries when full; pull repairs what push drops.

pub mod client;
pub mod peer;
pub mod peer_set;
pub mod protocol;
pub mod queue;

#[cfg(test)]
mod tests;
