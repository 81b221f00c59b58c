//! Binary layout of checkpointed state.
//!
//! # Wire Format
//!
//! ```text
//! EnumeratorState:
//! [version:u8]
//! [shard count:varint]   { id:str, parent count:u8, parents:str*, status:u8, stage }*
//! [pending count:varint] { id:str, position }*
//! [assigned count:varint]{ id:str, worker:varint, position }*
//!
//! stage = [tag:u8] value
//!   tag 0 waiting for parents  position to start from once they finish
//!   tag 1 finished             (no value)
//!   tag 2 pending or assigned  (no value; listed in exactly one table below)
//!
//! ReaderCheckpoint:
//! [version:u8]
//! [split count:varint] { [version:u8] id:str, position }*
//!
//! position = [kind:u8] value
//!   kind 0 TRIM_HORIZON    (no value)
//!   kind 1 LATEST          (no value)
//!   kind 2 SEQUENCE_NUMBER str
//!   kind 3 TIMESTAMP       i64 big-endian
//!
//! str = [len:varint][utf-8 bytes]
//! ```
//!
//! Version 1 enumerator state carries a bare `finished:u8` flag as the
//! stage. A shard with flag 0 that is neither pending nor assigned waits
//! for its parents and starts at `TRIM_HORIZON`.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    ReaderCheckpoint, SplitCheckpoint, ENUMERATOR_STATE_VERSION, READER_CHECKPOINT_VERSION,
    SPLIT_STATE_VERSION,
};
use crate::enumerator::state::{EnumeratorState, KnownShard, ShardProgress};
use crate::error::CheckpointError;
use crate::shard::{PositionKind, SequenceNumber, ShardId, ShardStatus, StartingPosition, WorkerId};

/// Largest string the decoder accepts.
const MAX_STRING_LEN: u64 = 64 * 1024;

const STAGE_AWAITING: u8 = 0;
const STAGE_FINISHED: u8 = 1;
const STAGE_ACTIVE: u8 = 2;

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn get_varint(buf: &mut Bytes, field: &'static str) -> Result<u64, CheckpointError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(CheckpointError::Truncated(field));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CheckpointError::Corrupt(format!("varint overflow in {field}")))
}

fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, CheckpointError> {
    if buf.has_remaining() {
        Ok(buf.get_u8())
    } else {
        Err(CheckpointError::Truncated(field))
    }
}

fn get_len(buf: &mut Bytes, field: &'static str) -> Result<usize, CheckpointError> {
    let n = get_varint(buf, field)?;
    usize::try_from(n).map_err(|_| CheckpointError::Corrupt(format!("{field} out of range: {n}")))
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_str(buf: &mut Bytes, field: &'static str) -> Result<String, CheckpointError> {
    let len = get_varint(buf, field)?;
    if len > MAX_STRING_LEN {
        return Err(CheckpointError::Corrupt(format!("{field} length {len} too large")));
    }
    let len = usize::try_from(len)
        .map_err(|_| CheckpointError::Corrupt(format!("{field} length {len} too large")))?;
    if buf.remaining() < len {
        return Err(CheckpointError::Truncated(field));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| CheckpointError::Corrupt(format!("{field} is not UTF-8: {e}")))
}

fn put_position(buf: &mut BytesMut, position: &StartingPosition) {
    buf.put_u8(position.kind() as u8);
    match position {
        StartingPosition::TrimHorizon | StartingPosition::Latest => {}
        StartingPosition::AfterSequenceNumber(seq) => put_str(buf, seq.as_str()),
        StartingPosition::AtTimestamp(ts) => buf.put_i64(*ts),
    }
}

fn get_position(buf: &mut Bytes) -> Result<StartingPosition, CheckpointError> {
    let tag = get_u8(buf, "position kind")?;
    let kind = PositionKind::from_tag(tag)
        .ok_or_else(|| CheckpointError::Corrupt(format!("unknown position kind {tag}")))?;
    Ok(match kind {
        PositionKind::TrimHorizon => StartingPosition::TrimHorizon,
        PositionKind::Latest => StartingPosition::Latest,
        PositionKind::SequenceNumber => {
            let raw = get_str(buf, "sequence number")?;
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CheckpointError::Corrupt(format!("invalid sequence number '{raw}'")));
            }
            StartingPosition::AfterSequenceNumber(SequenceNumber::new(raw))
        }
        PositionKind::Timestamp => {
            if buf.remaining() < 8 {
                return Err(CheckpointError::Truncated("timestamp"));
            }
            StartingPosition::AtTimestamp(buf.get_i64())
        }
    })
}

fn check_version(found: u8, supported: u8) -> Result<(), CheckpointError> {
    if found == 0 || found > supported {
        Err(CheckpointError::UnsupportedVersion { found, supported })
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EnumeratorState
// ---------------------------------------------------------------------------

/// Serializes enumerator state.
#[must_use]
pub fn encode_enumerator_state(state: &EnumeratorState) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(ENUMERATOR_STATE_VERSION);

    put_varint(&mut buf, state.shards().len() as u64);
    for (id, shard) in state.shards() {
        put_str(&mut buf, id.as_str());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8(shard.parent_shard_ids.len() as u8);
        for parent in &shard.parent_shard_ids {
            put_str(&mut buf, parent.as_str());
        }
        buf.put_u8(match shard.status {
            ShardStatus::Open => 0,
            ShardStatus::Closed => 1,
        });
        match &shard.progress {
            ShardProgress::AwaitingParents { start } => {
                buf.put_u8(STAGE_AWAITING);
                put_position(&mut buf, start);
            }
            ShardProgress::Finished => buf.put_u8(STAGE_FINISHED),
            ShardProgress::Pending(_) | ShardProgress::Assigned { .. } => buf.put_u8(STAGE_ACTIVE),
        }
    }

    let pending: Vec<_> = state.pending().collect();
    put_varint(&mut buf, pending.len() as u64);
    for (id, position) in pending {
        put_str(&mut buf, id.as_str());
        put_position(&mut buf, position);
    }

    let assigned: Vec<_> = state
        .shards()
        .iter()
        .filter_map(|(id, s)| match &s.progress {
            ShardProgress::Assigned { worker, position } => Some((id, *worker, position)),
            _ => None,
        })
        .collect();
    put_varint(&mut buf, assigned.len() as u64);
    for (id, worker, position) in assigned {
        put_str(&mut buf, id.as_str());
        put_varint(&mut buf, u64::from(worker.0));
        put_position(&mut buf, position);
    }

    buf.freeze()
}

/// Deserializes enumerator state and validates its invariants.
///
/// # Errors
///
/// Returns `CheckpointError::UnsupportedVersion` for an unknown version,
/// `Truncated`/`Corrupt` for malformed bytes and `InvariantViolation` if the
/// decoded state is not a state the enumerator could have produced.
pub fn decode_enumerator_state(bytes: &[u8]) -> Result<EnumeratorState, CheckpointError> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let version = get_u8(&mut buf, "version")?;
    check_version(version, ENUMERATOR_STATE_VERSION)?;

    let shard_count = get_len(&mut buf, "shard count")?;
    let mut shards = BTreeMap::new();
    let mut finished = BTreeSet::new();
    // Shards that must appear in the pending or assigned table. Version 1
    // does not mark them, so any unfinished shard may be claimed there.
    let mut active = BTreeSet::new();
    for _ in 0..shard_count {
        let id = ShardId::new(get_str(&mut buf, "shard id")?);
        let parent_count = get_u8(&mut buf, "parent count")?;
        let mut parents = Vec::with_capacity(usize::from(parent_count));
        for _ in 0..parent_count {
            parents.push(ShardId::new(get_str(&mut buf, "parent id")?));
        }
        let status = match get_u8(&mut buf, "shard status")? {
            0 => ShardStatus::Open,
            1 => ShardStatus::Closed,
            other => return Err(CheckpointError::Corrupt(format!("unknown shard status {other}"))),
        };
        let progress = match get_u8(&mut buf, "shard stage")? {
            STAGE_AWAITING if version == 1 => ShardProgress::AwaitingParents {
                start: StartingPosition::TrimHorizon,
            },
            STAGE_AWAITING => ShardProgress::AwaitingParents {
                start: get_position(&mut buf)?,
            },
            STAGE_FINISHED => {
                finished.insert(id.clone());
                ShardProgress::Finished
            }
            STAGE_ACTIVE if version >= 2 => {
                active.insert(id.clone());
                // replaced by the pending or assigned entry
                ShardProgress::AwaitingParents {
                    start: StartingPosition::TrimHorizon,
                }
            }
            other => return Err(CheckpointError::Corrupt(format!("invalid shard stage {other}"))),
        };
        let known = KnownShard {
            parent_shard_ids: parents,
            status,
            progress,
        };
        if shards.insert(id.clone(), known).is_some() {
            return Err(CheckpointError::InvariantViolation(format!("shard {id} listed twice")));
        }
    }

    let mut claimed: BTreeSet<ShardId> = BTreeSet::new();
    let mut claim = |id: &ShardId, what: &str| -> Result<(), CheckpointError> {
        if !shards.contains_key(id) {
            return Err(CheckpointError::InvariantViolation(format!("{what} shard {id} is unknown")));
        }
        if finished.contains(id) {
            return Err(CheckpointError::InvariantViolation(format!("{what} shard {id} is finished")));
        }
        if version >= 2 && !active.contains(id) {
            return Err(CheckpointError::InvariantViolation(format!(
                "{what} shard {id} is waiting for its parents"
            )));
        }
        if !claimed.insert(id.clone()) {
            return Err(CheckpointError::InvariantViolation(format!(
                "shard {id} is both pending and assigned"
            )));
        }
        Ok(())
    };

    let pending_count = get_len(&mut buf, "pending count")?;
    let mut pending = Vec::with_capacity(pending_count.min(shard_count));
    for _ in 0..pending_count {
        let id = ShardId::new(get_str(&mut buf, "pending id")?);
        let position = get_position(&mut buf)?;
        claim(&id, "pending")?;
        pending.push((id, ShardProgress::Pending(position)));
    }

    let assigned_count = get_len(&mut buf, "assignment count")?;
    let mut assigned = Vec::with_capacity(assigned_count.min(shard_count));
    for _ in 0..assigned_count {
        let id = ShardId::new(get_str(&mut buf, "assigned id")?);
        let raw_worker = get_varint(&mut buf, "worker id")?;
        let worker = u32::try_from(raw_worker)
            .map_err(|_| CheckpointError::Corrupt(format!("worker id {raw_worker} out of range")))?;
        let position = get_position(&mut buf)?;
        claim(&id, "assigned")?;
        assigned.push((
            id,
            ShardProgress::Assigned {
                worker: WorkerId(worker),
                position,
            },
        ));
    }

    if buf.has_remaining() {
        return Err(CheckpointError::Corrupt(format!(
            "{} trailing bytes after enumerator state",
            buf.remaining()
        )));
    }

    if let Some(id) = active.difference(&claimed).next() {
        return Err(CheckpointError::InvariantViolation(format!(
            "shard {id} is neither pending nor assigned"
        )));
    }

    for (id, progress) in pending.into_iter().chain(assigned) {
        if let Some(shard) = shards.get_mut(&id) {
            shard.progress = progress;
        }
    }

    let state = EnumeratorState::from_shards(shards);
    state
        .check_invariants()
        .map_err(CheckpointError::InvariantViolation)?;
    Ok(state)
}

// ---------------------------------------------------------------------------
// ReaderCheckpoint
// ---------------------------------------------------------------------------

/// Serializes one split's position, version tag included.
pub fn encode_split(buf: &mut BytesMut, split: &SplitCheckpoint) {
    buf.put_u8(SPLIT_STATE_VERSION);
    put_str(buf, split.shard_id.as_str());
    put_position(buf, &split.position);
}

/// Deserializes one split's position.
///
/// # Errors
///
/// Returns a [`CheckpointError`] for an unknown version or malformed bytes.
pub fn decode_split(buf: &mut Bytes) -> Result<SplitCheckpoint, CheckpointError> {
    let version = get_u8(buf, "split version")?;
    check_version(version, SPLIT_STATE_VERSION)?;
    let shard_id = ShardId::new(get_str(buf, "split id")?);
    let position = get_position(buf)?;
    Ok(SplitCheckpoint { shard_id, position })
}

/// Serializes a reader checkpoint.
#[must_use]
pub fn encode_reader_checkpoint(checkpoint: &ReaderCheckpoint) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(READER_CHECKPOINT_VERSION);
    put_varint(&mut buf, checkpoint.splits.len() as u64);
    for split in &checkpoint.splits {
        encode_split(&mut buf, split);
    }
    buf.freeze()
}

/// Deserializes a reader checkpoint.
///
/// # Errors
///
/// Returns a [`CheckpointError`] for an unknown reader or split version,
/// malformed bytes, or a split listed twice.
pub fn decode_reader_checkpoint(bytes: &[u8]) -> Result<ReaderCheckpoint, CheckpointError> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let version = get_u8(&mut buf, "reader version")?;
    check_version(version, READER_CHECKPOINT_VERSION)?;
    let count = get_len(&mut buf, "split count")?;
    let mut seen = BTreeSet::new();
    let mut splits = Vec::new();
    for _ in 0..count {
        let split = decode_split(&mut buf)?;
        if !seen.insert(split.shard_id.clone()) {
            return Err(CheckpointError::InvariantViolation(format!(
                "split {} listed twice",
                split.shard_id
            )));
        }
        splits.push(split);
    }
    if buf.has_remaining() {
        return Err(CheckpointError::Corrupt(format!(
            "{} trailing bytes after reader checkpoint",
            buf.remaining()
        )));
    }
    Ok(ReaderCheckpoint { splits })
}
