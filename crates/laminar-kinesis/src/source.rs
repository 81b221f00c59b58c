//! Runtime harness wiring the enumerator and readers together.
//!
//! [`KinesisSource`] spawns one enumerator actor and `parallelism` reader
//! tasks on the current tokio runtime. Every reader pushes into the same
//! bounded channel, so the caller sees a single stream of
//! [`SourceEvent`]s.
//!
//! # Checkpoints
//!
//! [`KinesisSource::checkpoint`] captures a globally consistent state:
//!
//! 1. pause the enumerator so no assignment or completion is applied,
//! 2. snapshot every reader; each one writes a [`SourceEvent::Barrier`]
//!    into the channel at the exact point its snapshot covers,
//! 3. snapshot the enumerator,
//! 4. resume the enumerator.
//!
//! Records a reader emits before its barrier are covered by the checkpoint;
//! records after it are replayed after a restore. The caller must keep
//! draining the channel while a checkpoint is in progress.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assigner::{create_assigner, ShardAssigner};
use crate::checkpoint::SourceCheckpoint;
use crate::config::KinesisSourceConfig;
use crate::emitter::{KinesisRecord, RecordDeserializer, RecordOutput};
use crate::enumerator::{spawn_enumerator, EnumeratorHandle, ShardEnumerator};
use crate::error::ConnectorError;
use crate::metrics::{EnumeratorMetricsSnapshot, ReaderMetricsSnapshot};
use crate::proxy::StreamProxy;
use crate::reader::{spawn_reader, ReaderHandle, SplitReader};
use crate::shard::WorkerId;

/// Default capacity of the event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An event delivered to the consumer of a [`KinesisSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent<T> {
    /// A record from one of the shards.
    Record(KinesisRecord<T>),

    /// Every record `worker` emitted before this event is covered by
    /// checkpoint `checkpoint_id`.
    Barrier {
        /// Reader that wrote the barrier.
        worker: WorkerId,
        /// Checkpoint the barrier belongs to.
        checkpoint_id: u64,
    },
}

#[async_trait]
impl<T: Send> RecordOutput<T> for mpsc::Sender<SourceEvent<T>> {
    async fn emit(&mut self, record: KinesisRecord<T>) -> Result<(), ConnectorError> {
        self.send(SourceEvent::Record(record))
            .await
            .map_err(|_| ConnectorError::ChannelClosed("source events".into()))
    }

    async fn barrier(&mut self, worker: WorkerId, checkpoint_id: u64) -> Result<(), ConnectorError> {
        self.send(SourceEvent::Barrier {
            worker,
            checkpoint_id,
        })
        .await
        .map_err(|_| ConnectorError::ChannelClosed("source events".into()))
    }
}

/// Builder for [`KinesisSource`].
pub struct KinesisSourceBuilder<T> {
    config: KinesisSourceConfig,
    proxy: Arc<dyn StreamProxy>,
    deserializer: Arc<dyn RecordDeserializer<T>>,
    parallelism: u32,
    assigner: Option<Arc<dyn ShardAssigner>>,
    restore: Option<SourceCheckpoint>,
    channel_capacity: usize,
}

impl<T> std::fmt::Debug for KinesisSourceBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinesisSourceBuilder")
            .field("stream_arn", &self.config.stream_arn)
            .field("parallelism", &self.parallelism)
            .field("restore", &self.restore.as_ref().map(|c| c.checkpoint_id))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> KinesisSourceBuilder<T> {
    /// Number of reader tasks. Defaults to 1.
    #[must_use]
    pub fn parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Use a custom assignment policy instead of the configured one.
    #[must_use]
    pub fn assigner(mut self, assigner: Arc<dyn ShardAssigner>) -> Self {
        self.assigner = Some(assigner);
        self
    }

    /// Resume from a previously taken checkpoint.
    ///
    /// The parallelism may differ from the one the checkpoint was taken
    /// with; splits of readers that no longer exist are reassigned with
    /// their checkpointed positions.
    #[must_use]
    pub fn restore_from(mut self, checkpoint: SourceCheckpoint) -> Self {
        self.restore = Some(checkpoint);
        self
    }

    /// Capacity of the event channel.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Spawns the enumerator and readers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConfigurationError` for an invalid config,
    /// zero parallelism or zero channel capacity, and
    /// `ConnectorError::Checkpoint` if the restored checkpoint is
    /// inconsistent.
    pub fn start(self) -> Result<(KinesisSource<T>, mpsc::Receiver<SourceEvent<T>>), ConnectorError> {
        self.config.validate()?;
        if self.parallelism == 0 {
            return Err(ConnectorError::ConfigurationError(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConnectorError::ConfigurationError(
                "channel capacity must be at least 1".into(),
            ));
        }

        let assigner = self
            .assigner
            .unwrap_or_else(|| create_assigner(self.config.assigner));
        let live: BTreeSet<WorkerId> = (0..self.parallelism).map(WorkerId).collect();

        let (enumerator, mut resumed, next_checkpoint_id) = match self.restore {
            Some(checkpoint) => {
                let owned = checkpoint.owned_splits();
                let mut enumerator = ShardEnumerator::new(
                    &self.config,
                    assigner,
                    Some(checkpoint.enumerator),
                );
                let resumed = enumerator.reconcile_restored(&owned, &live)?;
                info!(
                    stream = %self.config.stream_arn,
                    checkpoint_id = checkpoint.checkpoint_id,
                    readers = checkpoint.readers.len(),
                    parallelism = self.parallelism,
                    "Restoring Kinesis source"
                );
                (enumerator, resumed, checkpoint.checkpoint_id + 1)
            }
            None => (
                ShardEnumerator::new(&self.config, assigner, None),
                BTreeMap::new(),
                1,
            ),
        };

        let start_time_ms = self.proxy.current_time_ms();
        let enumerator = enumerator.with_start_time(start_time_ms);
        debug!(stream = %self.config.stream_arn, start_time_ms, "job start time pinned");

        let cancel = CancellationToken::new();
        let (enumerator, enumerator_join) = spawn_enumerator(
            enumerator,
            Arc::clone(&self.proxy),
            &self.config,
            cancel.clone(),
        );

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let readers = live
            .into_iter()
            .map(|worker| {
                let reader = SplitReader::new(
                    worker,
                    &self.config,
                    Arc::clone(&self.proxy),
                    Arc::clone(&self.deserializer),
                );
                let splits = resumed.remove(&worker).unwrap_or_default();
                spawn_reader(reader, splits, tx.clone(), enumerator.clone(), cancel.clone())
            })
            .collect();

        info!(
            stream = %self.config.stream_arn,
            parallelism = self.parallelism,
            "Kinesis source started"
        );

        let source = KinesisSource {
            stream_arn: self.config.stream_arn,
            enumerator,
            enumerator_join: Some(enumerator_join),
            readers,
            cancel,
            next_checkpoint_id,
            _marker: PhantomData,
        };
        Ok((source, rx))
    }
}

/// A running Kinesis source.
pub struct KinesisSource<T> {
    stream_arn: String,
    enumerator: EnumeratorHandle,
    enumerator_join: Option<JoinHandle<Result<(), ConnectorError>>>,
    readers: Vec<ReaderHandle>,
    cancel: CancellationToken,
    next_checkpoint_id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for KinesisSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinesisSource")
            .field("stream_arn", &self.stream_arn)
            .field("readers", &self.readers.len())
            .field("next_checkpoint_id", &self.next_checkpoint_id)
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> KinesisSource<T> {
    /// Starts building a source over `proxy`.
    #[must_use]
    pub fn builder(
        config: KinesisSourceConfig,
        proxy: Arc<dyn StreamProxy>,
        deserializer: Arc<dyn RecordDeserializer<T>>,
    ) -> KinesisSourceBuilder<T> {
        KinesisSourceBuilder {
            config,
            proxy,
            deserializer,
            parallelism: 1,
            assigner: None,
            restore: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Stream being read.
    #[must_use]
    pub fn stream_arn(&self) -> &str {
        &self.stream_arn
    }

    /// Number of reader tasks.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.readers.len()
    }

    /// Returns `true` once the source stopped, by shutdown or a fatal error.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the source stops.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Metrics of every reader, by worker.
    #[must_use]
    pub fn reader_metrics(&self) -> BTreeMap<WorkerId, ReaderMetricsSnapshot> {
        self.readers
            .iter()
            .map(|r| (r.worker, r.metrics.snapshot()))
            .collect()
    }

    /// Metrics of the enumerator.
    #[must_use]
    pub fn enumerator_metrics(&self) -> EnumeratorMetricsSnapshot {
        self.enumerator.metrics().snapshot()
    }

    /// Takes a consistent checkpoint of the whole source.
    ///
    /// The enumerator is resumed even if capturing fails.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the enumerator or a reader
    /// has stopped.
    pub async fn checkpoint(&mut self) -> Result<SourceCheckpoint, ConnectorError> {
        let checkpoint_id = self.next_checkpoint_id;
        self.enumerator.pause().await?;
        let captured = self.capture(checkpoint_id).await;
        let resumed = self.enumerator.resume();
        let checkpoint = captured?;
        resumed?;

        self.next_checkpoint_id += 1;
        debug!(
            checkpoint_id,
            readers = checkpoint.readers.len(),
            shards = checkpoint.enumerator.shards().len(),
            "Checkpoint captured"
        );
        Ok(checkpoint)
    }

    async fn capture(&self, checkpoint_id: u64) -> Result<SourceCheckpoint, ConnectorError> {
        let mut readers = BTreeMap::new();
        for reader in &self.readers {
            readers.insert(reader.worker, reader.snapshot(checkpoint_id).await?);
        }
        let enumerator = self.enumerator.snapshot().await?;
        Ok(SourceCheckpoint {
            checkpoint_id,
            enumerator,
            readers,
        })
    }

    /// Stops every task and waits for them.
    ///
    /// # Errors
    ///
    /// Returns the first error a task stopped with: the enumerator's, then
    /// the readers' in worker order.
    pub async fn shutdown(mut self) -> Result<(), ConnectorError> {
        self.cancel.cancel();
        let mut first_error = None;

        if let Some(join) = self.enumerator_join.take() {
            record_outcome(&mut first_error, "enumerator", join.await);
        }
        for reader in self.readers.drain(..) {
            let name = format!("reader {}", reader.worker);
            record_outcome(&mut first_error, &name, reader.join.await);
        }

        info!(stream = %self.stream_arn, "Kinesis source stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T> Drop for KinesisSource<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn record_outcome(
    first_error: &mut Option<ConnectorError>,
    task: &str,
    outcome: Result<Result<(), ConnectorError>, tokio::task::JoinError>,
) {
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => ConnectorError::TaskFailed(format!("{task}: {e}")),
    };
    if first_error.is_none() {
        *first_error = Some(err);
    } else {
        warn!(task, error = %err, "additional task failure during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{RetryConfig, StartingPositionKind};
    use crate::emitter::Utf8Deserializer;
    use crate::error::ProxyError;
    use crate::shard::{HashKeyRange, SequenceNumber, Shard, ShardId, StartingPosition};
    use crate::testing::MockStreamProxy;

    fn config() -> KinesisSourceConfig {
        let mut cfg = KinesisSourceConfig::new("stream");
        cfg.starting_position = StartingPositionKind::TrimHorizon;
        cfg.poll_interval = Duration::from_millis(50);
        cfg.discovery_interval = Duration::from_millis(500);
        cfg.retry = RetryConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: false,
        };
        cfg
    }

    fn mock(shards: &[&str]) -> Arc<MockStreamProxy> {
        let proxy = Arc::new(MockStreamProxy::new("stream"));
        for id in shards {
            proxy.add_shard(Shard::root(*id, HashKeyRange::FULL));
        }
        proxy
    }

    fn start(
        proxy: &Arc<MockStreamProxy>,
        parallelism: u32,
        restore: Option<SourceCheckpoint>,
    ) -> (KinesisSource<String>, mpsc::Receiver<SourceEvent<String>>) {
        let mut builder = KinesisSource::builder(
            config(),
            Arc::clone(proxy) as Arc<dyn StreamProxy>,
            Arc::new(Utf8Deserializer),
        )
        .parallelism(parallelism);
        if let Some(cp) = restore {
            builder = builder.restore_from(cp);
        }
        builder.start().unwrap()
    }

    async fn records(
        rx: &mut mpsc::Receiver<SourceEvent<String>>,
        n: usize,
    ) -> Vec<KinesisRecord<String>> {
        let mut out = Vec::new();
        while out.len() < n {
            let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("timed out waiting for records")
                .expect("event channel closed");
            if let SourceEvent::Record(r) = event {
                out.push(r);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_all_shards_in_order() {
        let proxy = mock(&["s1", "s2"]);
        for i in 0..5 {
            proxy.put_record("s1", format!("a{i}"));
            proxy.put_record("s2", format!("b{i}"));
        }
        let (source, mut rx) = start(&proxy, 2, None);

        let got = records(&mut rx, 10).await;
        for shard in ["s1", "s2"] {
            let seqs: Vec<&SequenceNumber> = got
                .iter()
                .filter(|r| r.metadata.shard_id.as_str() == shard)
                .map(|r| &r.metadata.sequence_number)
                .collect();
            assert_eq!(seqs.len(), 5);
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
        let emitted: u64 = source
            .reader_metrics()
            .values()
            .map(|m| m.records_emitted)
            .sum();
        assert_eq!(emitted, 10);
        assert_eq!(source.enumerator_metrics().splits_assigned, 2);

        source.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_writes_barriers_and_positions() {
        let proxy = mock(&["s1", "s2"]);
        let last_s1 = (0..3).map(|i| proxy.put_record("s1", format!("{i}"))).last();
        let last_s2 = proxy.put_record("s2", "only");
        let (mut source, mut rx) = start(&proxy, 2, None);
        records(&mut rx, 4).await;

        let cp = source.checkpoint().await.unwrap();
        assert_eq!(cp.checkpoint_id, 1);
        assert_eq!(cp.readers.len(), 2);

        let owned = cp.owned_splits();
        assert_eq!(
            owned[&ShardId::new("s1")].1,
            StartingPosition::continue_after(last_s1.unwrap())
        );
        assert_eq!(
            owned[&ShardId::new("s2")].1,
            StartingPosition::continue_after(last_s2)
        );

        let mut barriers = BTreeSet::new();
        while barriers.len() < 2 {
            if let Some(SourceEvent::Barrier {
                worker,
                checkpoint_id,
            }) = rx.recv().await
            {
                assert_eq!(checkpoint_id, 1);
                barriers.insert(worker);
            }
        }
        assert_eq!(barriers, BTreeSet::from([WorkerId(0), WorkerId(1)]));

        assert_eq!(source.checkpoint().await.unwrap().checkpoint_id, 2);
        source.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_with_fewer_readers_resumes_positions() {
        let proxy = mock(&["s1", "s2", "s3"]);
        for shard in ["s1", "s2", "s3"] {
            proxy.put_record(shard, format!("{shard}-old"));
        }
        let (mut source, mut rx) = start(&proxy, 3, None);
        records(&mut rx, 3).await;
        let cp = source.checkpoint().await.unwrap();
        source.shutdown().await.unwrap();
        drop(rx);

        for shard in ["s1", "s2", "s3"] {
            proxy.put_record(shard, format!("{shard}-new"));
        }
        let bytes = cp.to_bytes();
        let restored = SourceCheckpoint::from_bytes(&bytes).unwrap();
        let (source, mut rx) = start(&proxy, 1, Some(restored));
        assert_eq!(source.parallelism(), 1);

        let mut got: Vec<String> = records(&mut rx, 3).await.into_iter().map(|r| r.value).collect();
        got.sort();
        assert_eq!(got, vec!["s1-new", "s2-new", "s3-new"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        source.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_parallelism_rejected() {
        let proxy = mock(&["s1"]);
        let result = KinesisSource::<String>::builder(
            config(),
            proxy as Arc<dyn StreamProxy>,
            Arc::new(Utf8Deserializer),
        )
        .parallelism(0)
        .start();
        assert!(matches!(result, Err(ConnectorError::ConfigurationError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_discovery_error_stops_source() {
        let proxy = Arc::new(MockStreamProxy::new("some-other-stream"));
        let (source, _rx) = start(&proxy, 1, None);

        tokio::time::timeout(Duration::from_secs(10), source.stopped())
            .await
            .unwrap();
        assert!(source.is_stopped());
        assert!(matches!(
            source.shutdown().await,
            Err(ConnectorError::Proxy(ProxyError::ResourceNotFound(_)))
        ));
    }
}
