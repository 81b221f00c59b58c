//! Per-worker polling of assigned splits.
//!
//! [`SplitReader`] keeps one [`SplitState`] per owned split and fetches a
//! split only when it is due, so a throttled or idle shard never delays
//! the others. The tokio task driving a reader lives in [`task`].

pub mod task;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::checkpoint::{ReaderCheckpoint, SplitCheckpoint};
use crate::config::{KinesisSourceConfig, RetryConfig};
use crate::emitter::{RecordEmitter, RecordOutput};
use crate::error::{ConnectorError, ProxyError};
use crate::metrics::ReaderMetrics;
use crate::proxy::StreamProxy;
use crate::shard::{ShardId, ShardSplit, StartingPosition, WorkerId};

pub use task::{spawn_reader, ReaderCommand, ReaderHandle};

/// Progress of one owned split.
#[derive(Debug)]
pub struct SplitState {
    /// The assigned split.
    pub split: ShardSplit,
    /// Position after the last emitted record.
    pub current_position: StartingPosition,
    iterator: Option<String>,
    next_poll_at: Instant,
    backoff: Backoff,
}

impl SplitState {
    fn new(split: ShardSplit, retry: &RetryConfig) -> Self {
        Self {
            current_position: split.starting_position.clone(),
            split,
            iterator: None,
            next_poll_at: Instant::now(),
            backoff: retry.backoff(),
        }
    }

    /// When this split may be fetched next.
    #[must_use]
    pub fn next_poll_at(&self) -> Instant {
        self.next_poll_at
    }

    /// Returns `true` if a service cursor is held.
    #[must_use]
    pub fn has_iterator(&self) -> bool {
        self.iterator.is_some()
    }
}

/// What one fetch of a split produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Records were emitted.
    Records(usize),
    /// The fetch succeeded without records.
    Empty,
    /// The shard is drained; the split was removed.
    Finished,
    /// A transient failure; the split is retried after the delay.
    Retrying(Duration),
    /// The iterator expired and will be re-created from the current position.
    IteratorExpired,
}

/// Polls the splits owned by one worker.
pub struct SplitReader<T> {
    worker: WorkerId,
    stream_arn: String,
    proxy: Arc<dyn StreamProxy>,
    emitter: RecordEmitter<T>,
    poll_interval: Duration,
    max_records: usize,
    retry: RetryConfig,
    splits: BTreeMap<ShardId, SplitState>,
    metrics: Arc<ReaderMetrics>,
}

impl<T> std::fmt::Debug for SplitReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitReader")
            .field("worker", &self.worker)
            .field("splits", &self.splits.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> SplitReader<T> {
    /// Create a reader for `worker`.
    #[must_use]
    pub fn new(
        worker: WorkerId,
        config: &KinesisSourceConfig,
        proxy: Arc<dyn StreamProxy>,
        deserializer: Arc<dyn crate::emitter::RecordDeserializer<T>>,
    ) -> Self {
        let metrics = Arc::new(ReaderMetrics::default());
        Self {
            worker,
            stream_arn: config.stream_arn.clone(),
            proxy,
            emitter: RecordEmitter::new(deserializer, Arc::clone(&metrics)),
            poll_interval: config.poll_interval,
            max_records: config.max_records_per_fetch,
            retry: config.retry.clone(),
            splits: BTreeMap::new(),
            metrics,
        }
    }

    /// Worker this reader runs as.
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<ReaderMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Owned splits.
    #[must_use]
    pub fn splits(&self) -> &BTreeMap<ShardId, SplitState> {
        &self.splits
    }

    /// Takes ownership of `splits`. A split already owned keeps its state.
    ///
    /// A split starting at `LATEST` is pinned to the service's current time,
    /// so its checkpointed position never depends on when it is restored.
    pub fn add_splits(&mut self, splits: Vec<ShardSplit>) {
        for mut split in splits {
            if self.splits.contains_key(&split.shard_id) {
                warn!(worker = %self.worker, shard_id = %split.shard_id, "split already owned");
                continue;
            }
            if split.starting_position == StartingPosition::Latest {
                split.starting_position = StartingPosition::AtTimestamp(self.proxy.current_time_ms());
            }
            info!(
                worker = %self.worker,
                shard_id = %split.shard_id,
                position = %split.starting_position,
                "split added"
            );
            self.splits
                .insert(split.shard_id.clone(), SplitState::new(split, &self.retry));
        }
    }

    /// Earliest time any split is due, `None` when idle.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.splits.values().map(|s| s.next_poll_at).min()
    }

    /// Current positions of all owned splits.
    #[must_use]
    pub fn snapshot(&self) -> ReaderCheckpoint {
        ReaderCheckpoint {
            splits: self
                .splits
                .values()
                .map(|s| SplitCheckpoint {
                    shard_id: s.split.shard_id.clone(),
                    position: s.current_position.clone(),
                })
                .collect(),
        }
    }

    /// Fetches every split that is due and returns the ids of splits
    /// drained in this pass.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any split.
    pub async fn poll_due(
        &mut self,
        output: &mut (dyn RecordOutput<T> + '_),
    ) -> Result<Vec<ShardId>, ConnectorError> {
        let now = Instant::now();
        let due: Vec<ShardId> = self
            .splits
            .iter()
            .filter(|(_, s)| s.next_poll_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut finished = Vec::new();
        for shard_id in due {
            if self.poll_split(&shard_id, output).await? == FetchOutcome::Finished {
                finished.push(shard_id);
            }
        }
        Ok(finished)
    }

    /// Fetches one batch of `shard_id` and emits it.
    ///
    /// # Errors
    ///
    /// - `ConnectorError::StaleCursor` if the service rejects the position.
    /// - `ConnectorError::RetriesExhausted` if transient failures outlast
    ///   the retry budget.
    /// - `ConnectorError::Proxy` for other non-retriable service errors.
    /// - Emission errors from the output or deserializer.
    pub async fn poll_split(
        &mut self,
        shard_id: &ShardId,
        output: &mut (dyn RecordOutput<T> + '_),
    ) -> Result<FetchOutcome, ConnectorError> {
        let Some(state) = self.splits.get_mut(shard_id) else {
            return Err(ConnectorError::InvalidState {
                expected: format!("split {shard_id} owned by {}", self.worker),
                actual: "not owned".into(),
            });
        };

        let iterator = match &state.iterator {
            Some(it) => it.clone(),
            None => {
                match self
                    .proxy
                    .get_shard_iterator(&self.stream_arn, shard_id, &state.current_position)
                    .await
                {
                    Ok(it) => {
                        debug!(shard_id = %shard_id, position = %state.current_position, "iterator created");
                        state.iterator = Some(it.clone());
                        it
                    }
                    Err(e) => {
                        return Self::handle_failure(
                            self.worker,
                            state,
                            &self.metrics,
                            e,
                            "get_shard_iterator",
                        );
                    }
                }
            }
        };

        let response = match self.proxy.get_records(&iterator, self.max_records).await {
            Ok(resp) => resp,
            Err(ProxyError::ExpiredIterator(msg)) => {
                // The token expired but the position may still be valid.
                warn!(shard_id = %shard_id, reason = %msg, "iterator expired, re-creating");
                state.iterator = None;
                state.next_poll_at = Instant::now();
                self.metrics.record_iterator_refresh();
                return Ok(FetchOutcome::IteratorExpired);
            }
            Err(e) => {
                return Self::handle_failure(self.worker, state, &self.metrics, e, "get_records");
            }
        };

        state.backoff.reset();
        let count = response.records.len();
        self.metrics
            .record_fetch(count, response.millis_behind_latest);
        let exhausted = response.is_exhausted();

        let emitted = self
            .emitter
            .emit_batch(shard_id, response.records, &mut state.current_position, output)
            .await?;
        state.iterator = response.next_iterator;

        if exhausted {
            info!(worker = %self.worker, shard_id = %shard_id, "split drained");
            self.splits.remove(shard_id);
            self.metrics.record_split_finished();
            return Ok(FetchOutcome::Finished);
        }

        state.next_poll_at = Instant::now() + self.poll_interval;
        debug!(
            shard_id = %shard_id,
            records = count,
            emitted,
            millis_behind_latest = ?response.millis_behind_latest,
            "fetched"
        );
        Ok(if count == 0 {
            FetchOutcome::Empty
        } else {
            FetchOutcome::Records(emitted)
        })
    }

    fn handle_failure(
        worker: WorkerId,
        state: &mut SplitState,
        metrics: &ReaderMetrics,
        err: ProxyError,
        call: &'static str,
    ) -> Result<FetchOutcome, ConnectorError> {
        let shard_id = state.split.shard_id.clone();
        if err.is_retriable() {
            return match state.backoff.next_backoff() {
                Some(delay) => {
                    metrics.record_retry(err.is_throttling());
                    warn!(
                        worker = %worker,
                        shard_id = %shard_id,
                        call,
                        attempt = state.backoff.attempt(),
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "transient failure, backing off"
                    );
                    state.next_poll_at = Instant::now() + delay;
                    Ok(FetchOutcome::Retrying(delay))
                }
                None => {
                    let attempts = state.backoff.attempt();
                    error!(worker = %worker, shard_id = %shard_id, call, attempts, error = %err, "retries exhausted");
                    Err(ConnectorError::RetriesExhausted {
                        shard_id,
                        attempts,
                        last: err,
                    })
                }
            };
        }

        error!(worker = %worker, shard_id = %shard_id, call, error = %err, "fatal split error");
        match err {
            ProxyError::InvalidPosition(reason)
            | ProxyError::ResourceNotFound(reason)
            | ProxyError::InvalidArgument(reason)
            | ProxyError::ExpiredIterator(reason) => Err(ConnectorError::StaleCursor {
                shard_id,
                reason: format!("{call} rejected position {}: {reason}", state.current_position),
            }),
            other => Err(ConnectorError::Proxy(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{KinesisRecord, Utf8Deserializer};
    use crate::shard::{HashKeyRange, SequenceNumber, Shard};
    use crate::testing::{Fault, MockStreamProxy};

    fn config() -> KinesisSourceConfig {
        let mut cfg = KinesisSourceConfig::new("stream");
        cfg.poll_interval = Duration::from_millis(100);
        cfg.max_records_per_fetch = 2;
        cfg.retry = RetryConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: false,
        };
        cfg
    }

    fn setup(records: u64) -> (Arc<MockStreamProxy>, SplitReader<String>) {
        let proxy = Arc::new(MockStreamProxy::new("stream"));
        proxy.add_shard(Shard::root("s1", HashKeyRange::FULL));
        for i in 0..records {
            proxy.put_record("s1", format!("r{i}"));
        }
        let reader = SplitReader::new(
            WorkerId(0),
            &config(),
            Arc::clone(&proxy) as Arc<dyn StreamProxy>,
            Arc::new(Utf8Deserializer),
        );
        (proxy, reader)
    }

    fn split(position: StartingPosition) -> ShardSplit {
        ShardSplit::new("stream", "s1", position)
    }

    fn s1() -> ShardId {
        ShardId::new("s1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_emits_in_order_and_chains_iterator() {
        let (proxy, mut reader) = setup(3);
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        let mut out: Vec<KinesisRecord<String>> = Vec::new();

        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Records(2));
        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Records(1));
        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Empty);

        let values: Vec<&str> = out.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["r0", "r1", "r2"]);
        assert_eq!(proxy.iterator_calls(), 1);
        assert_eq!(
            reader.snapshot().position_of(&s1()),
            Some(&StartingPosition::continue_after(out[2].metadata.sequence_number.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_interval_respected() {
        let (_proxy, mut reader) = setup(5);
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        let mut out: Vec<KinesisRecord<String>> = Vec::new();

        assert_eq!(reader.poll_due(&mut out).await.unwrap(), Vec::<ShardId>::new());
        assert_eq!(out.len(), 2);
        // not due yet
        reader.poll_due(&mut out).await.unwrap();
        assert_eq!(out.len(), 2);

        tokio::time::advance(Duration::from_millis(100)).await;
        reader.poll_due(&mut out).await.unwrap();
        assert_eq!(out.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_then_success_no_duplicates() {
        let (proxy, mut reader) = setup(2);
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        proxy.inject(Fault::ThrottleRecords(2));
        let mut out: Vec<KinesisRecord<String>> = Vec::new();

        for _ in 0..2 {
            let outcome = reader.poll_split(&s1(), &mut out).await.unwrap();
            assert!(matches!(outcome, FetchOutcome::Retrying(_)));
            assert_eq!(reader.snapshot().position_of(&s1()), Some(&StartingPosition::TrimHorizon));
        }
        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Records(2));
        assert_eq!(out.len(), 2);
        assert_eq!(reader.metrics().snapshot().throttled_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (proxy, mut reader) = setup(1);
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        proxy.inject(Fault::TransientRecords(10));
        let mut out: Vec<KinesisRecord<String>> = Vec::new();

        for _ in 0..3 {
            assert!(matches!(
                reader.poll_split(&s1(), &mut out).await.unwrap(),
                FetchOutcome::Retrying(_)
            ));
        }
        let err = reader.poll_split(&s1(), &mut out).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_iterator_recovers_from_position() {
        let (proxy, mut reader) = setup(4);
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        reader.poll_split(&s1(), &mut out).await.unwrap();

        proxy.inject(Fault::ExpireIterators(1));
        assert_eq!(
            reader.poll_split(&s1(), &mut out).await.unwrap(),
            FetchOutcome::IteratorExpired
        );
        assert!(!reader.splits()[&s1()].has_iterator());
        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Records(2));

        let values: Vec<&str> = out.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["r0", "r1", "r2", "r3"]);
        assert_eq!(proxy.iterator_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_split_is_pinned_on_arrival() {
        let (proxy, mut reader) = setup(2);
        reader.add_splits(vec![split(StartingPosition::Latest)]);
        assert_eq!(
            reader.snapshot().position_of(&s1()),
            Some(&StartingPosition::AtTimestamp(proxy.current_time_ms()))
        );

        // an iterator re-created after expiry still starts at the pinned time
        proxy.put_record("s1", "fresh");
        proxy.inject(Fault::ExpireIterators(1));
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        assert_eq!(
            reader.poll_split(&s1(), &mut out).await.unwrap(),
            FetchOutcome::IteratorExpired
        );
        assert_eq!(reader.poll_split(&s1(), &mut out).await.unwrap(), FetchOutcome::Records(1));
        assert_eq!(out[0].value, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trimmed_position_is_stale_cursor() {
        let (proxy, mut reader) = setup(3);
        proxy.trim("s1", 2);
        reader.add_splits(vec![split(StartingPosition::continue_after(SequenceNumber::from("1")))]);
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        let err = reader.poll_split(&s1(), &mut out).await.unwrap_err();
        assert!(matches!(err, ConnectorError::StaleCursor { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_shard_finishes() {
        let (proxy, mut reader) = setup(1);
        proxy.close_shard("s1");
        reader.add_splits(vec![split(StartingPosition::TrimHorizon)]);
        let mut out: Vec<KinesisRecord<String>> = Vec::new();

        let finished = reader.poll_due(&mut out).await.unwrap();
        assert_eq!(finished, vec![s1()]);
        assert_eq!(out.len(), 1);
        assert!(reader.splits().is_empty());
        assert_eq!(reader.next_due(), None);
        assert!(reader.snapshot().splits.is_empty());
    }
}
