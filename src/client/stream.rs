use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use tokio_util::bytes::Bytes;

use crate::registry::filter::Filter;
use crate::registry::types::{Digest, Member};
use crate::server::protocol::{ClientSyncRequest, ENDPOINT_CLIENT_SYNC};

/// Members streamed from a node: the catch-up first, then live updates.
pub struct MemberStream {
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
}

/// Opens a read stream against the node at `addr`.
///
/// Members the caller already holds at `digest`'s version or newer are not
/// resent.
pub async fn subscribe(addr: &str, digest: &Digest, filter: Filter) -> Result<MemberStream> {
    let url = format!("http://{}{}", addr, ENDPOINT_CLIENT_SYNC);
    let request = ClientSyncRequest {
        digest: digest.clone(),
        filter,
    };

    let response = reqwest::Client::new()
        .post(&url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("failed to open read stream to {}", url))?
        .error_for_status()?;

    Ok(MemberStream {
        chunks: response.bytes_stream().boxed(),
        buf: Vec::new(),
    })
}

impl MemberStream {
    /// Next member, or `None` when the node ends the stream.
    pub async fn next(&mut self) -> Result<Option<Member>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let member = serde_json::from_slice(line).context("invalid member line")?;
                return Ok(Some(member));
            }

            match self.chunks.next().await {
                Some(chunk) => self
                    .buf
                    .extend_from_slice(&chunk.context("read stream failed")?),
                None => return Ok(None),
            }
        }
    }
}

/// A client-side copy of the members received on read streams.
///
/// Keeps the newest version per id; its digest resumes a stream without
/// receiving those members again.
#[derive(Debug, Clone, Default)]
pub struct MemberView {
    members: HashMap<String, Member>,
}

impl MemberView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `member` if it is newer than the held copy.
    pub fn apply(&mut self, member: Member) -> bool {
        match self.members.get(member.id()) {
            Some(existing) if existing.version >= member.version => false,
            _ => {
                self.members.insert(member.id().to_string(), member);
                true
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    /// Drops members whose tombstone or down record expired by `now`, the
    /// same way the registry removes them. Returns the dropped ids.
    pub fn expire(&mut self, now: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .members
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.state.id.clone())
            .collect();
        for id in &expired {
            self.members.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn digest(&self) -> Digest {
        self.members
            .iter()
            .map(|(id, m)| (id.clone(), m.version.clone()))
            .collect()
    }
}
