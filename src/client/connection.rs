use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::registry::types::MemberState;
use crate::server::protocol::{ClientUpdate, ENDPOINT_CLIENT_WRITE, ErrorResponse};

const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// A member's write stream to its registry node.
///
/// The node owns the member for as long as heartbeats keep arriving.
/// Dropping the connection without `leave` looks like a crash: the member
/// stays up until its heartbeat lapses.
pub struct MemberConnection {
    member_id: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl MemberConnection {
    /// Opens a write stream to the node at `addr` and registers `state`.
    pub async fn connect(addr: &str, state: MemberState) -> Result<Self> {
        let url = format!("ws://{}{}", addr, ENDPOINT_CLIENT_WRITE);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to open write stream to {}", url))?;

        let mut connection = Self {
            member_id: state.id.clone(),
            ws,
        };
        connection.send(&ClientUpdate::Join { state }).await?;
        Ok(connection)
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn send(&mut self, update: &ClientUpdate) -> Result<()> {
        let text = serde_json::to_string(update)?;
        self.ws
            .send(Message::text(text))
            .await
            .context("write stream closed")
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send(&ClientUpdate::Heartbeat).await
    }

    /// Sends a raw update; a second `JOIN` is answered with an error frame.
    pub async fn send_update(&mut self, update: &ClientUpdate) -> Result<()> {
        self.send(update).await
    }

    /// Next error frame from the node, or `None` once the stream is closed.
    pub async fn next_error(&mut self) -> Result<Option<ErrorResponse>> {
        while let Some(frame) = self.ws.next().await {
            match frame.context("write stream failed")? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Deregisters the member and waits for the node to close the stream.
    pub async fn leave(mut self) -> Result<()> {
        self.send(&ClientUpdate::Leave).await?;
        match tokio::time::timeout(LEAVE_TIMEOUT, self.next_error()).await {
            Ok(Ok(Some(err))) => anyhow::bail!("leave rejected: {}: {}", err.kind, err.description),
            Ok(Ok(None)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::debug!("No close from node after LEAVE for {}", self.member_id);
                Ok(())
            }
        }
    }

    /// Closes the stream without deregistering.
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("failed to close write stream")
    }

    /// Heartbeats every `interval` until `shutdown` fires, then leaves.
    pub async fn keep_alive(mut self, interval: Duration, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat().await?,
            }
        }
        self.leave().await
    }
}
