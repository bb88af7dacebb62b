use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::store::{LivenessReport, MemberStore};
use super::types::now_ms;

/// Periodically demotes members whose heartbeats lapsed, takes over members
/// of down registry nodes and removes expired records.
pub struct FailureDetector {
    store: Arc<MemberStore>,
    interval: Duration,
}

impl FailureDetector {
    pub fn new(store: Arc<MemberStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn check(&self, now: i64) -> LivenessReport {
        let report = self.store.check_liveness(now);
        if !report.is_empty() {
            tracing::debug!(
                "Failure detector: {} down, {} taken over, {} expired",
                report.marked_down.len(),
                report.taken_over.len(),
                report.expired.len()
            );
        }
        report
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check(now_ms());
                }
            }
        }

        tracing::debug!("Failure detector stopped");
    }
}
