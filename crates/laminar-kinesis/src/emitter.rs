//! Turning fetched records into application records.
//!
//! The emitter owns the rule that makes restarts exact: a split's position
//! moves past a record only after that record was handed to the output.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ConnectorError;
use crate::metrics::ReaderMetrics;
use crate::proxy::RawRecord;
use crate::shard::{SequenceNumber, ShardId, StartingPosition, WorkerId};

/// Metadata attached to every emitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Shard the record was read from.
    pub shard_id: ShardId,
    /// Position of the record within the shard.
    pub sequence_number: SequenceNumber,
    /// Producer-supplied partition key.
    pub partition_key: String,
    /// Arrival time at the service, epoch millis.
    pub approximate_arrival_timestamp: i64,
}

/// An application value plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinesisRecord<T> {
    /// Deserialized payload.
    pub value: T,
    /// Origin of the payload.
    pub metadata: RecordMetadata,
}

/// Converts raw payloads into application values.
pub trait RecordDeserializer<T>: Send + Sync {
    /// Deserialize one record.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the payload is not a valid `T`.
    fn deserialize(
        &self,
        record: &RawRecord,
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync>>;
}

/// Passes payload bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesDeserializer;

impl RecordDeserializer<Bytes> for RawBytesDeserializer {
    fn deserialize(
        &self,
        record: &RawRecord,
    ) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        Ok(record.data.clone())
    }
}

/// Decodes payloads as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Deserializer;

impl RecordDeserializer<String> for Utf8Deserializer {
    fn deserialize(
        &self,
        record: &RawRecord,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        Ok(std::str::from_utf8(&record.data)?.to_string())
    }
}

/// Destination of emitted records.
#[async_trait]
pub trait RecordOutput<T: Send>: Send {
    /// Hand one record downstream. Returns once the record is accepted.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if downstream is gone.
    async fn emit(&mut self, record: KinesisRecord<T>) -> Result<(), ConnectorError>;

    /// Marks the point in this reader's output that a checkpoint covers.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if downstream is gone.
    async fn barrier(&mut self, _worker: WorkerId, _checkpoint_id: u64) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[async_trait]
impl<T: Send> RecordOutput<T> for Vec<KinesisRecord<T>> {
    async fn emit(&mut self, record: KinesisRecord<T>) -> Result<(), ConnectorError> {
        self.push(record);
        Ok(())
    }
}

#[async_trait]
impl<T: Send> RecordOutput<T> for mpsc::Sender<KinesisRecord<T>> {
    async fn emit(&mut self, record: KinesisRecord<T>) -> Result<(), ConnectorError> {
        self.send(record)
            .await
            .map_err(|_| ConnectorError::ChannelClosed("record output".into()))
    }
}

/// Deserializes fetched records and advances split positions.
pub struct RecordEmitter<T> {
    deserializer: Arc<dyn RecordDeserializer<T>>,
    metrics: Arc<ReaderMetrics>,
}

impl<T> std::fmt::Debug for RecordEmitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordEmitter").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> RecordEmitter<T> {
    /// Create an emitter.
    #[must_use]
    pub fn new(deserializer: Arc<dyn RecordDeserializer<T>>, metrics: Arc<ReaderMetrics>) -> Self {
        Self {
            deserializer,
            metrics,
        }
    }

    /// Emits `records` of `shard_id` in order.
    ///
    /// `position` is advanced to just after each record once the output
    /// accepted it. Records at or before `position` are skipped. Returns
    /// the number of records emitted.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Deserialization` for a payload the
    /// deserializer rejects, or the output's error. In both cases
    /// `position` still reflects every record emitted before the failure.
    pub async fn emit_batch(
        &self,
        shard_id: &ShardId,
        records: Vec<RawRecord>,
        position: &mut StartingPosition,
        output: &mut (dyn RecordOutput<T> + '_),
    ) -> Result<usize, ConnectorError> {
        let mut emitted = 0;
        for raw in records {
            // already emitted before a restart
            if position
                .sequence_number()
                .is_some_and(|last| raw.sequence_number <= *last)
            {
                continue;
            }

            let value = self.deserializer.deserialize(&raw).map_err(|e| {
                ConnectorError::Deserialization {
                    shard_id: shard_id.clone(),
                    sequence_number: raw.sequence_number.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let sequence_number = raw.sequence_number;
            let record = KinesisRecord {
                value,
                metadata: RecordMetadata {
                    shard_id: shard_id.clone(),
                    sequence_number: sequence_number.clone(),
                    partition_key: raw.partition_key,
                    approximate_arrival_timestamp: raw.approximate_arrival_timestamp,
                },
            };

            output.emit(record).await?;
            *position = StartingPosition::continue_after(sequence_number);
            self.metrics.record_emit();
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seq: u64, data: &[u8]) -> RawRecord {
        RawRecord {
            sequence_number: seq.into(),
            partition_key: format!("pk-{seq}"),
            data: Bytes::copy_from_slice(data),
            approximate_arrival_timestamp: 1_700_000_000_000 + i64::try_from(seq).unwrap(),
        }
    }

    fn emitter() -> RecordEmitter<String> {
        RecordEmitter::new(Arc::new(Utf8Deserializer), Arc::new(ReaderMetrics::default()))
    }

    #[tokio::test]
    async fn test_emit_advances_position_per_record() {
        let e = emitter();
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        let mut pos = StartingPosition::TrimHorizon;
        let n = e
            .emit_batch(
                &ShardId::new("s1"),
                vec![raw(1, b"a"), raw(2, b"b")],
                &mut pos,
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(pos, StartingPosition::continue_after(2u64.into()));
        assert_eq!(out[0].value, "a");
        assert_eq!(out[1].metadata.sequence_number, SequenceNumber::from(2u64));
        assert_eq!(out[1].metadata.partition_key, "pk-2");
        assert_eq!(out[1].metadata.shard_id, ShardId::new("s1"));
    }

    #[tokio::test]
    async fn test_records_at_or_before_position_skipped() {
        let e = emitter();
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        let mut pos = StartingPosition::continue_after(42u64.into());
        e.emit_batch(
            &ShardId::new("s4"),
            vec![raw(41, b"x"), raw(42, b"y"), raw(43, b"z")],
            &mut pos,
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, "z");
    }

    #[tokio::test]
    async fn test_deserialization_failure_keeps_position() {
        let e = emitter();
        let mut out: Vec<KinesisRecord<String>> = Vec::new();
        let mut pos = StartingPosition::TrimHorizon;
        let err = e
            .emit_batch(
                &ShardId::new("s1"),
                vec![raw(1, b"ok"), raw(2, &[0xff, 0xfe]), raw(3, b"never")],
                &mut pos,
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Deserialization { ref sequence_number, .. } if sequence_number == "2"));
        assert_eq!(out.len(), 1);
        assert_eq!(pos, StartingPosition::continue_after(1u64.into()));
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_advance() {
        let e = emitter();
        let (mut tx, rx) = mpsc::channel::<KinesisRecord<String>>(1);
        drop(rx);
        let mut pos = StartingPosition::Latest;
        let err = e
            .emit_batch(&ShardId::new("s1"), vec![raw(1, b"a")], &mut pos, &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ChannelClosed(_)));
        assert_eq!(pos, StartingPosition::Latest);
    }

    #[test]
    fn test_raw_bytes_passthrough() {
        let r = raw(1, b"\x00\x01");
        assert_eq!(RawBytesDeserializer.deserialize(&r).unwrap(), r.data);
    }
}
