//! Distributed Service Registry Library
//!
//! This library crate defines the modules of a registry node and the client
//! SDK. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`registry`**: The member store. Versioned last-writer-wins records, the
//!   subscription broker and the heartbeat failure detector.
//! - **`replication`**: Push of applied writes to every peer node plus a
//!   periodic digest/delta anti-entropy pull.
//! - **`membership`**: A UDP gossip protocol (SWIM-like) that discovers registry
//!   nodes and detects their failure.
//! - **`cluster`**: Turns membership events into replication peers and owner
//!   bookkeeping for takeover.
//! - **`server`**: The axum RPC and admin surfaces.
//! - **`node`**: Wires everything into a running node with graceful shutdown.
//! - **`client`**: SDK for members, subscribers and the admin CLI.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod registry;
pub mod replication;
pub mod server;
