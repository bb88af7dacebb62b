use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

use super::protocol::{
    ENDPOINT_REPLICA_SYNC, ENDPOINT_REPLICA_UPDATE, ReplicaSyncRequest, ReplicaSyncResponse,
    ReplicaUpdateRequest, ReplicaUpdateResponse,
};
use crate::config::ReplicationConfig;
use crate::error::{RegistryError, RegistryResult};

/// HTTP client for the replica endpoints of other registry nodes.
///
/// Every failure to reach a peer or read its answer is a
/// `RegistryError::Transport`.
#[derive(Clone)]
pub struct ReplicaClient {
    http_client: reqwest::Client,
    request_timeout: Duration,
    attempts: usize,
}

impl ReplicaClient {
    pub fn new(config: &ReplicationConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_attempt_timeout)
            .build()
            .context("failed to build replica http client")?;

        Ok(Self {
            http_client,
            request_timeout: config.request_timeout,
            attempts: config.update_attempts.max(1),
        })
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        attempts: usize,
    ) -> RegistryResult<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.request_timeout)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(RegistryError::Transport(format!("{}: {}", url, e)));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(RegistryError::Transport(format!(
            "{}: retry attempts exhausted",
            url
        )))
    }

    /// Pushes one update, retrying with backoff.
    pub async fn update(&self, addr: &str, request: &ReplicaUpdateRequest) -> RegistryResult<bool> {
        let url = format!("http://{}{}", addr, ENDPOINT_REPLICA_UPDATE);
        let response = self.post_with_retry(url, request, self.attempts).await?;
        let ack: ReplicaUpdateResponse = response.json().await.map_err(|e| {
            RegistryError::Transport(format!("invalid replica update response: {}", e))
        })?;
        Ok(ack.applied)
    }

    /// Sends an anti-entropy digest and returns the newer members. Not retried;
    /// the next repair tick tries again.
    pub async fn sync(
        &self,
        addr: &str,
        request: &ReplicaSyncRequest,
    ) -> RegistryResult<ReplicaSyncResponse> {
        let url = format!("http://{}{}", addr, ENDPOINT_REPLICA_SYNC);
        let response = self.post_with_retry(url, request, 1).await?;
        response
            .json()
            .await
            .map_err(|e| RegistryError::Transport(format!("invalid replica sync response: {}", e)))
    }
}
