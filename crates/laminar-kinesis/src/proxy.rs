//! Stream service client boundary.
//!
//! The connector never talks to the network directly. Everything it needs
//! from the service goes through [`StreamProxy`], which an embedding
//! application implements on top of its SDK of choice.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProxyError;
use crate::shard::{SequenceNumber, Shard, ShardId, StartingPosition};

/// One page of a shard listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListShardsPage {
    /// Shards on this page.
    pub shards: Vec<Shard>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// A record as returned by the service, before deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Position of the record within its shard.
    pub sequence_number: SequenceNumber,
    /// Partition key the producer supplied.
    pub partition_key: String,
    /// Opaque payload.
    pub data: Bytes,
    /// Arrival time at the service, epoch millis.
    pub approximate_arrival_timestamp: i64,
}

/// Result of one `getRecords` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetRecordsResponse {
    /// Records in shard order.
    pub records: Vec<RawRecord>,
    /// Cursor for the next call; `None` once a closed shard is drained.
    pub next_iterator: Option<String>,
    /// How far the returned batch is behind the shard's tip.
    pub millis_behind_latest: Option<u64>,
}

impl GetRecordsResponse {
    /// Returns `true` if the shard has no more records and never will.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.next_iterator.is_none()
    }
}

/// Client for the shard-based stream service.
///
/// Retriable failures are reported as [`ProxyError::Throttled`] or
/// [`ProxyError::Transient`]; callers own the retry policy.
#[async_trait]
pub trait StreamProxy: Send + Sync {
    /// Lists one page of shards of `stream_arn`.
    async fn list_shards(
        &self,
        stream_arn: &str,
        next_token: Option<&str>,
    ) -> Result<ListShardsPage, ProxyError>;

    /// Resolves `position` within `shard_id` into an iterator token.
    async fn get_shard_iterator(
        &self,
        stream_arn: &str,
        shard_id: &ShardId,
        position: &StartingPosition,
    ) -> Result<String, ProxyError>;

    /// Fetches up to `max_records` records starting at `iterator`.
    async fn get_records(
        &self,
        iterator: &str,
        max_records: usize,
    ) -> Result<GetRecordsResponse, ProxyError>;

    /// Current time on the service's arrival clock, epoch millis.
    ///
    /// A record written after this call has an arrival timestamp at or
    /// above the returned value. `LATEST` is pinned to it so the position
    /// stays meaningful across a restore.
    fn current_time_ms(&self) -> i64 {
        system_time_ms()
    }
}

/// Wall-clock time in epoch millis.
#[must_use]
pub fn system_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Follows continuation tokens until the full shard listing is collected.
///
/// # Errors
///
/// Returns the first [`ProxyError`] any page reports.
pub async fn list_all_shards(
    proxy: &dyn StreamProxy,
    stream_arn: &str,
) -> Result<Vec<Shard>, ProxyError> {
    let mut shards = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = proxy.list_shards(stream_arn, token.as_deref()).await?;
        shards.extend(page.shards);
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(shards),
        }
    }
}
