//! Checkpointed state of the source.
//!
//! A [`SourceCheckpoint`] is what one consistent capture produces: the
//! enumerator's shard graph plus every reader's split positions. Its byte
//! form is self-contained; persisting it is the caller's job.

pub mod codec;

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::enumerator::state::EnumeratorState;
use crate::error::CheckpointError;
use crate::shard::{ShardId, StartingPosition, WorkerId};

use codec::{get_varint, put_varint};

/// Current version of the enumerator state layout.
///
/// Version 2 records the start position of shards waiting for their
/// parents. Version 1 state is still read; its waiting shards start at
/// `TRIM_HORIZON`.
pub const ENUMERATOR_STATE_VERSION: u8 = 2;

/// Current version of the per-split layout.
pub const SPLIT_STATE_VERSION: u8 = 1;

/// Current version of the [`ReaderCheckpoint`] layout.
pub const READER_CHECKPOINT_VERSION: u8 = 1;

/// Current version of the [`SourceCheckpoint`] envelope.
pub const SOURCE_CHECKPOINT_VERSION: u8 = 1;

/// Position of one split owned by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCheckpoint {
    /// Split (shard) identifier.
    pub shard_id: ShardId,
    /// Where reading resumes.
    pub position: StartingPosition,
}

/// Positions of every unfinished split of one reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderCheckpoint {
    /// Splits in shard id order.
    pub splits: Vec<SplitCheckpoint>,
}

impl ReaderCheckpoint {
    /// Position of `shard_id`, if this reader owns it.
    #[must_use]
    pub fn position_of(&self, shard_id: &ShardId) -> Option<&StartingPosition> {
        self.splits
            .iter()
            .find(|s| &s.shard_id == shard_id)
            .map(|s| &s.position)
    }

    /// Serialize.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        codec::encode_reader_checkpoint(self)
    }

    /// Deserialize.
    ///
    /// # Errors
    ///
    /// See [`codec::decode_reader_checkpoint`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        codec::decode_reader_checkpoint(bytes)
    }
}

/// One globally consistent capture of the whole source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCheckpoint {
    /// Monotonic id assigned by the source.
    pub checkpoint_id: u64,
    /// Enumerator state.
    pub enumerator: EnumeratorState,
    /// Reader states by worker.
    pub readers: BTreeMap<WorkerId, ReaderCheckpoint>,
}

impl SourceCheckpoint {
    /// Every split held by any reader, with its owner and position.
    #[must_use]
    pub fn owned_splits(&self) -> BTreeMap<ShardId, (WorkerId, StartingPosition)> {
        self.readers
            .iter()
            .flat_map(|(worker, cp)| {
                cp.splits
                    .iter()
                    .map(move |s| (s.shard_id.clone(), (*worker, s.position.clone())))
            })
            .collect()
    }

    /// Serialize as
    /// `[version][id:varint][len:varint][enumerator][readers:varint]{worker:varint, len:varint, reader}*`.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(SOURCE_CHECKPOINT_VERSION);
        put_varint(&mut buf, self.checkpoint_id);

        let enumerator = codec::encode_enumerator_state(&self.enumerator);
        put_varint(&mut buf, enumerator.len() as u64);
        buf.put_slice(&enumerator);

        put_varint(&mut buf, self.readers.len() as u64);
        for (worker, reader) in &self.readers {
            put_varint(&mut buf, u64::from(worker.0));
            let bytes = reader.to_bytes();
            put_varint(&mut buf, bytes.len() as u64);
            buf.put_slice(&bytes);
        }
        buf.freeze()
    }

    /// Deserialize.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] for an unknown version, malformed
    /// bytes, a split held by two readers, or invalid nested state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        if !buf.has_remaining() {
            return Err(CheckpointError::Truncated("version"));
        }
        let version = buf.get_u8();
        if version == 0 || version > SOURCE_CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: version,
                supported: SOURCE_CHECKPOINT_VERSION,
            });
        }
        let checkpoint_id = get_varint(&mut buf, "checkpoint id")?;
        let enumerator_bytes = take_section(&mut buf, "enumerator state")?;
        let enumerator = codec::decode_enumerator_state(&enumerator_bytes)?;

        let reader_count = get_varint(&mut buf, "reader count")?;
        let mut readers = BTreeMap::new();
        for _ in 0..reader_count {
            let raw = get_varint(&mut buf, "worker id")?;
            let worker = u32::try_from(raw)
                .map_err(|_| CheckpointError::Corrupt(format!("worker id {raw} out of range")))?;
            let section = take_section(&mut buf, "reader checkpoint")?;
            let reader = ReaderCheckpoint::from_bytes(&section)?;
            if readers.insert(WorkerId(worker), reader).is_some() {
                return Err(CheckpointError::InvariantViolation(format!(
                    "reader {worker} listed twice"
                )));
            }
        }
        if buf.has_remaining() {
            return Err(CheckpointError::Corrupt(format!(
                "{} trailing bytes after source checkpoint",
                buf.remaining()
            )));
        }

        let cp = Self {
            checkpoint_id,
            enumerator,
            readers,
        };
        let total: usize = cp.readers.values().map(|r| r.splits.len()).sum();
        if cp.owned_splits().len() != total {
            return Err(CheckpointError::InvariantViolation(
                "a split is held by more than one reader".into(),
            ));
        }
        Ok(cp)
    }
}

fn take_section(buf: &mut Bytes, field: &'static str) -> Result<Bytes, CheckpointError> {
    let len = get_varint(buf, field)?;
    let len = usize::try_from(len)
        .map_err(|_| CheckpointError::Corrupt(format!("{field} length {len} too large")))?;
    if buf.remaining() < len {
        return Err(CheckpointError::Truncated(field));
    }
    Ok(buf.split_to(len))
}
