//! Client SDK
//!
//! Thin async clients for the three surfaces a registry node exposes:
//!
//! - **`MemberConnection`**: A member's write stream (JOIN, HEARTBEAT, LEAVE).
//! - **`subscribe` / `MemberStream`**: A digest-seeded read stream, with
//!   `MemberView` to hold what was received and resume from its digest.
//! - **`AdminClient`**: Read-only admin queries used by the CLI.

pub mod admin;
pub mod connection;
pub mod stream;

pub use admin::AdminClient;
pub use connection::MemberConnection;
pub use stream::{MemberStream, MemberView, subscribe};
