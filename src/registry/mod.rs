//! Registry Module
//!
//! The per-node view of the member set.
//!
//! ## Components
//! - **`types`**: Wire model (`Member`, `MemberState`, `Version`, `Liveness`).
//! - **`store`**: The versioned, last-writer-wins member map with digest/delta primitives.
//! - **`broker`**: Bounded per-subscriber fan-out of applied writes.
//! - **`filter`**: Equality filters for client subscriptions.
//! - **`failure_detector`**: Heartbeat lapse, takeover and expiry worker.

pub mod broker;
pub mod failure_detector;
pub mod filter;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
