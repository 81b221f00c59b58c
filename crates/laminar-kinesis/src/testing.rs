//! In-memory stream service for tests.
//!
//! [`MockStreamProxy`] keeps an append-only log per shard, supports the
//! resharding operations of the real service (split, merge, close,
//! retention trimming) and can inject faults into individual calls.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ProxyError;
use crate::proxy::{GetRecordsResponse, ListShardsPage, RawRecord, StreamProxy};
use crate::shard::{HashKeyRange, SequenceNumber, Shard, ShardId, ShardStatus, StartingPosition};

/// Arrival timestamp of the record with sequence number 0.
const BASE_ARRIVAL_MS: i64 = 1_700_000_000_000;

/// Faults the mock injects into upcoming calls. Counts accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Throttle the next `n` `list_shards` calls.
    ThrottleListings(u32),
    /// Throttle the next `n` `get_shard_iterator` calls.
    ThrottleIterators(u32),
    /// Throttle the next `n` `get_records` calls.
    ThrottleRecords(u32),
    /// Fail the next `n` `get_records` calls with a transient error.
    TransientRecords(u32),
    /// Report the iterator of the next `n` `get_records` calls as expired.
    ExpireIterators(u32),
}

#[derive(Debug, Default)]
struct Faults {
    throttle_listings: u32,
    throttle_iterators: u32,
    throttle_records: u32,
    transient_records: u32,
    expire_iterators: u32,
}

/// Arrival clock of the mock: one millisecond per record written.
fn arrival_of(seq: u64) -> i64 {
    BASE_ARRIVAL_MS.saturating_add(i64::try_from(seq).unwrap_or(i64::MAX))
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug)]
struct ShardLog {
    shard: Shard,
    records: Vec<RawRecord>,
    trimmed: usize,
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<ShardId>,
    logs: HashMap<ShardId, ShardLog>,
    next_sequence: u64,
    faults: Faults,
    list_calls: u64,
    iterator_calls: u64,
    records_calls: u64,
}

impl Inner {
    fn log(&self, shard_id: &ShardId) -> Result<&ShardLog, ProxyError> {
        self.logs
            .get(shard_id)
            .ok_or_else(|| ProxyError::ResourceNotFound(format!("shard {shard_id}")))
    }
}

/// In-memory [`StreamProxy`].
#[derive(Debug)]
pub struct MockStreamProxy {
    stream_arn: String,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl MockStreamProxy {
    /// Empty stream named `stream_arn`.
    #[must_use]
    pub fn new(stream_arn: impl Into<String>) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            page_size: usize::MAX,
            inner: Mutex::new(Inner {
                next_sequence: 1,
                ..Inner::default()
            }),
        }
    }

    /// Limit listing pages to `page_size` shards.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Adds a shard. Panics if the id is taken.
    pub fn add_shard(&self, shard: Shard) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.logs.contains_key(&shard.shard_id),
            "shard {} already exists",
            shard.shard_id
        );
        inner.order.push(shard.shard_id.clone());
        inner.logs.insert(
            shard.shard_id.clone(),
            ShardLog {
                shard,
                records: Vec::new(),
                trimmed: 0,
            },
        );
    }

    /// Appends a record and returns its sequence number. The partition key is
    /// `pk-<sequence number>`.
    ///
    /// # Panics
    ///
    /// Panics if the shard is unknown or closed.
    pub fn put_record(&self, shard_id: &str, data: impl Into<Bytes>) -> SequenceNumber {
        let mut inner = self.inner.lock();
        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        let log = inner
            .logs
            .get_mut(&ShardId::from(shard_id))
            .unwrap_or_else(|| panic!("unknown shard {shard_id}"));
        assert!(!log.shard.is_closed(), "shard {shard_id} is closed");
        let sequence_number = SequenceNumber::from(seq);
        log.records.push(RawRecord {
            sequence_number: sequence_number.clone(),
            partition_key: format!("pk-{seq}"),
            data: data.into(),
            approximate_arrival_timestamp: arrival_of(seq),
        });
        sequence_number
    }

    /// Closes a shard: it stops accepting writes and reads end after its
    /// last record.
    pub fn close_shard(&self, shard_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(log) = inner.logs.get_mut(&ShardId::from(shard_id)) {
            log.shard.status = ShardStatus::Closed;
        }
    }

    /// Splits `parent` into two children covering its two key-range halves.
    pub fn split_shard(&self, parent: &str, left: &str, right: &str) {
        let range = self.range_of(parent);
        self.close_shard(parent);
        let (lo, hi) = range.halves();
        self.add_shard(Shard::child(left, &[parent], lo));
        self.add_shard(Shard::child(right, &[parent], hi));
    }

    /// Merges two shards into `child`.
    pub fn merge_shards(&self, first: &str, second: &str, child: &str) {
        let a = self.range_of(first);
        let b = self.range_of(second);
        self.close_shard(first);
        self.close_shard(second);
        let range = HashKeyRange::new(a.start.min(b.start), a.end.max(b.end));
        self.add_shard(Shard::child(child, &[first, second], range));
    }

    /// Drops the oldest `count` records of a shard, as retention would.
    pub fn trim(&self, shard_id: &str, count: usize) {
        let mut inner = self.inner.lock();
        if let Some(log) = inner.logs.get_mut(&ShardId::from(shard_id)) {
            log.trimmed = (log.trimmed + count).min(log.records.len());
        }
    }

    /// Schedules a fault.
    pub fn inject(&self, fault: Fault) {
        let mut inner = self.inner.lock();
        let f = &mut inner.faults;
        match fault {
            Fault::ThrottleListings(n) => f.throttle_listings += n,
            Fault::ThrottleIterators(n) => f.throttle_iterators += n,
            Fault::ThrottleRecords(n) => f.throttle_records += n,
            Fault::TransientRecords(n) => f.transient_records += n,
            Fault::ExpireIterators(n) => f.expire_iterators += n,
        }
    }

    /// Current listing, in creation order.
    #[must_use]
    pub fn shards(&self) -> Vec<Shard> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.logs.get(id).map(|l| l.shard.clone()))
            .collect()
    }

    /// Ids of shards still accepting writes.
    #[must_use]
    pub fn open_shards(&self) -> Vec<ShardId> {
        self.shards()
            .into_iter()
            .filter(|s| !s.is_closed())
            .map(|s| s.shard_id)
            .collect()
    }

    /// Every record ever written to `shard_id`, trimmed ones included.
    #[must_use]
    pub fn records(&self, shard_id: &str) -> Vec<RawRecord> {
        let inner = self.inner.lock();
        inner
            .logs
            .get(&ShardId::from(shard_id))
            .map(|l| l.records.clone())
            .unwrap_or_default()
    }

    /// Number of `list_shards` calls so far.
    #[must_use]
    pub fn list_calls(&self) -> u64 {
        self.inner.lock().list_calls
    }

    /// Number of `get_shard_iterator` calls so far.
    #[must_use]
    pub fn iterator_calls(&self) -> u64 {
        self.inner.lock().iterator_calls
    }

    /// Number of `get_records` calls so far.
    #[must_use]
    pub fn records_calls(&self) -> u64 {
        self.inner.lock().records_calls
    }

    fn range_of(&self, shard_id: &str) -> HashKeyRange {
        let inner = self.inner.lock();
        inner
            .logs
            .get(&ShardId::from(shard_id))
            .map_or(HashKeyRange::FULL, |l| l.shard.hash_key_range)
    }

    fn check_stream(&self, stream_arn: &str) -> Result<(), ProxyError> {
        if stream_arn == self.stream_arn {
            Ok(())
        } else {
            Err(ProxyError::ResourceNotFound(format!("stream {stream_arn}")))
        }
    }
}

fn encode_iterator(shard_id: &ShardId, offset: usize) -> String {
    format!("{shard_id}|{offset}")
}

fn decode_iterator(token: &str) -> Result<(ShardId, usize), ProxyError> {
    let (shard, offset) = token
        .rsplit_once('|')
        .ok_or_else(|| ProxyError::InvalidArgument(format!("malformed iterator '{token}'")))?;
    let offset = offset
        .parse()
        .map_err(|_| ProxyError::InvalidArgument(format!("malformed iterator '{token}'")))?;
    Ok((ShardId::from(shard), offset))
}

#[async_trait]
impl StreamProxy for MockStreamProxy {
    async fn list_shards(
        &self,
        stream_arn: &str,
        next_token: Option<&str>,
    ) -> Result<ListShardsPage, ProxyError> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        self.check_stream(stream_arn)?;
        if take(&mut inner.faults.throttle_listings) {
            return Err(ProxyError::Throttled("list_shards rate exceeded".into()));
        }
        let start: usize = match next_token {
            None => 0,
            Some(t) => t
                .parse()
                .map_err(|_| ProxyError::InvalidArgument(format!("bad token '{t}'")))?,
        };
        let end = start.saturating_add(self.page_size).min(inner.order.len());
        let shards = inner.order[start.min(end)..end]
            .iter()
            .filter_map(|id| inner.logs.get(id).map(|l| l.shard.clone()))
            .collect();
        let next_token = (end < inner.order.len()).then(|| end.to_string());
        Ok(ListShardsPage { shards, next_token })
    }

    async fn get_shard_iterator(
        &self,
        stream_arn: &str,
        shard_id: &ShardId,
        position: &StartingPosition,
    ) -> Result<String, ProxyError> {
        let mut inner = self.inner.lock();
        inner.iterator_calls += 1;
        self.check_stream(stream_arn)?;
        if take(&mut inner.faults.throttle_iterators) {
            return Err(ProxyError::Throttled("get_shard_iterator rate exceeded".into()));
        }
        let log = inner.log(shard_id)?;
        let offset = match position {
            StartingPosition::TrimHorizon => log.trimmed,
            StartingPosition::Latest => log.records.len(),
            StartingPosition::AfterSequenceNumber(seq) => {
                let next = log.records.partition_point(|r| r.sequence_number <= *seq);
                if next < log.trimmed {
                    return Err(ProxyError::InvalidPosition(format!(
                        "sequence number {seq} of shard {shard_id} is past retention"
                    )));
                }
                next
            }
            StartingPosition::AtTimestamp(ts) => {
                let next = log
                    .records
                    .partition_point(|r| r.approximate_arrival_timestamp < *ts);
                next.max(log.trimmed)
            }
        };
        Ok(encode_iterator(shard_id, offset))
    }

    async fn get_records(
        &self,
        iterator: &str,
        max_records: usize,
    ) -> Result<GetRecordsResponse, ProxyError> {
        let mut inner = self.inner.lock();
        inner.records_calls += 1;
        if take(&mut inner.faults.expire_iterators) {
            return Err(ProxyError::ExpiredIterator(format!("iterator {iterator} expired")));
        }
        if take(&mut inner.faults.throttle_records) {
            return Err(ProxyError::Throttled("get_records rate exceeded".into()));
        }
        if take(&mut inner.faults.transient_records) {
            return Err(ProxyError::Transient("connection reset".into()));
        }

        let (shard_id, offset) = decode_iterator(iterator)?;
        let log = inner.log(&shard_id)?;
        if offset < log.trimmed {
            return Err(ProxyError::ExpiredIterator(format!(
                "iterator {iterator} points before the trim horizon"
            )));
        }
        let len = log.records.len();
        let start = offset.min(len);
        let end = start.saturating_add(max_records).min(len);
        let records = log.records[start..end].to_vec();

        let next_iterator = if log.shard.is_closed() && end == len {
            None
        } else {
            Some(encode_iterator(&shard_id, end))
        };
        let millis_behind_latest = match (records.last(), log.records.last()) {
            (Some(returned), Some(latest)) => u64::try_from(
                latest.approximate_arrival_timestamp - returned.approximate_arrival_timestamp,
            )
            .ok(),
            _ => Some(0),
        };

        Ok(GetRecordsResponse {
            records,
            next_iterator,
            millis_behind_latest,
        })
    }

    fn current_time_ms(&self) -> i64 {
        arrival_of(self.inner.lock().next_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_and_read_to_end() {
        let proxy = MockStreamProxy::new("s");
        proxy.add_shard(Shard::root("p", HashKeyRange::FULL));
        proxy.put_record("p", "a");
        proxy.split_shard("p", "l", "r");

        let shards = proxy.shards();
        assert_eq!(shards.len(), 3);
        assert!(shards[0].is_closed());
        assert_eq!(shards[1].parent_shard_ids, vec![ShardId::new("p")]);
        assert_eq!(proxy.open_shards(), vec![ShardId::new("l"), ShardId::new("r")]);

        let it = proxy
            .get_shard_iterator("s", &ShardId::new("p"), &StartingPosition::TrimHorizon)
            .await
            .unwrap();
        let resp = proxy.get_records(&it, 10).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert!(resp.is_exhausted());
    }

    #[tokio::test]
    async fn test_positions() {
        let proxy = MockStreamProxy::new("s");
        proxy.add_shard(Shard::root("a", HashKeyRange::FULL));
        let seqs: Vec<_> = (0..4).map(|i| proxy.put_record("a", format!("{i}"))).collect();
        let id = ShardId::new("a");

        let it = proxy
            .get_shard_iterator("s", &id, &StartingPosition::continue_after(seqs[1].clone()))
            .await
            .unwrap();
        let resp = proxy.get_records(&it, 10).await.unwrap();
        assert_eq!(resp.records[0].sequence_number, seqs[2]);
        assert_eq!(resp.millis_behind_latest, Some(0));

        let it = proxy
            .get_shard_iterator("s", &id, &StartingPosition::Latest)
            .await
            .unwrap();
        assert!(proxy.get_records(&it, 10).await.unwrap().records.is_empty());

        proxy.trim("a", 2);
        let err = proxy
            .get_shard_iterator("s", &id, &StartingPosition::continue_after(seqs[0].clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidPosition(_)));
    }

    #[tokio::test]
    async fn test_current_time_separates_past_and_future_writes() {
        let proxy = MockStreamProxy::new("s");
        proxy.add_shard(Shard::root("a", HashKeyRange::FULL));
        proxy.put_record("a", "before");
        let now = proxy.current_time_ms();
        proxy.put_record("a", "after");

        let it = proxy
            .get_shard_iterator("s", &ShardId::new("a"), &StartingPosition::AtTimestamp(now))
            .await
            .unwrap();
        let resp = proxy.get_records(&it, 10).await.unwrap();
        assert_eq!(resp.records.len(), 1);
        assert_eq!(&resp.records[0].data[..], b"after");
    }

    #[tokio::test]
    async fn test_faults_consumed_in_order() {
        let proxy = MockStreamProxy::new("s");
        proxy.inject(Fault::ThrottleListings(1));
        assert!(proxy.list_shards("s", None).await.unwrap_err().is_throttling());
        assert!(proxy.list_shards("s", None).await.is_ok());
        assert!(matches!(
            proxy.list_shards("nope", None).await,
            Err(ProxyError::ResourceNotFound(_))
        ));
        assert_eq!(proxy.list_calls(), 3);
    }
}
