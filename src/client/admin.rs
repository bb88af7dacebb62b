use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::registry::store::StoreStats;
use crate::registry::types::Member;
use crate::replication::peer::PeerStatus;
use crate::server::protocol::{
    ENDPOINT_ADMIN_MEMBERS, ENDPOINT_ADMIN_PEERS, ENDPOINT_ADMIN_STATS, ErrorResponse,
    MembersResponse, admin_member_path,
};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the admin listener of one registry node.
#[derive(Clone)]
pub struct AdminClient {
    http_client: reqwest::Client,
    addr: String,
}

impl AdminClient {
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(ADMIN_TIMEOUT)
            .build()
            .context("failed to build admin http client")?;
        Ok(Self {
            http_client,
            addr: addr.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("http://{}{}", self.addr, path);
        self.http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid response from {}", url))
    }

    pub async fn members(&self) -> Result<Vec<Member>> {
        let response: MembersResponse = self.get(ENDPOINT_ADMIN_MEMBERS).await?;
        Ok(response.members)
    }

    /// Looks up one member; `None` when the node answers `NOT_FOUND`.
    pub async fn member(&self, id: &str) -> Result<Option<Member>> {
        let url = format!("http://{}{}", self.addr, admin_member_path(id));
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let err: ErrorResponse = response
                .json()
                .await
                .context("invalid not-found response")?;
            tracing::debug!("{}: {}", err.kind, err.description);
            return Ok(None);
        }

        let member = response
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("invalid response from {}", url))?;
        Ok(Some(member))
    }

    pub async fn peers(&self) -> Result<Vec<PeerStatus>> {
        self.get(ENDPOINT_ADMIN_PEERS).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.get(ENDPOINT_ADMIN_STATS).await
    }
}
