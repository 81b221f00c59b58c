//! Shard data model.
//!
//! A [`Shard`] is the service's description of one partition of the
//! stream. A [`ShardSplit`] is the unit of work handed to a reader: one
//! shard plus the position reading should start from.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a shard, unique within a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a reader (a parallel worker instance).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A record's position within its shard.
///
/// Sequence numbers are decimal strings that can exceed 128 bits, so they
/// are kept as text and compared numerically: a shorter number (after
/// stripping leading zeros) is always smaller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    /// Create a sequence number, normalizing away leading zeros.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim_start_matches('0');
        if trimmed.is_empty() {
            Self("0".to_string())
        } else if trimmed.len() == value.len() {
            Self(value)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Return the inner string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for SequenceNumber {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Inclusive range of partition-key hashes served by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKeyRange {
    /// First hash key (inclusive).
    pub start: u128,
    /// Last hash key (inclusive).
    pub end: u128,
}

impl HashKeyRange {
    /// The range covering the whole key space.
    pub const FULL: Self = Self {
        start: 0,
        end: u128::MAX,
    };

    /// Create a new range.
    #[must_use]
    pub const fn new(start: u128, end: u128) -> Self {
        Self { start, end }
    }

    /// Split the range in two halves, as a shard split would.
    #[must_use]
    pub const fn halves(&self) -> (Self, Self) {
        let mid = self.start + (self.end - self.start) / 2;
        (Self::new(self.start, mid), Self::new(mid + 1, self.end))
    }

    /// Returns `true` if `other` starts right after this range ends.
    #[must_use]
    pub const fn is_adjacent_to(&self, other: &Self) -> bool {
        self.end != u128::MAX && self.end + 1 == other.start
    }
}

/// Lifecycle status of a shard as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardStatus {
    /// Accepting writes.
    Open,
    /// No longer accepting writes; readable until drained.
    Closed,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("OPEN"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

/// A shard as described by a listing response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Shard identifier.
    pub shard_id: ShardId,
    /// Parents: none for original shards, one for split children, two for a merge child.
    pub parent_shard_ids: Vec<ShardId>,
    /// Hash keys served by this shard.
    pub hash_key_range: HashKeyRange,
    /// Open or closed.
    pub status: ShardStatus,
}

impl Shard {
    /// An open shard without parents.
    #[must_use]
    pub fn root(shard_id: impl Into<ShardId>, hash_key_range: HashKeyRange) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids: Vec::new(),
            hash_key_range,
            status: ShardStatus::Open,
        }
    }

    /// An open shard created by resharding `parents`.
    #[must_use]
    pub fn child(
        shard_id: impl Into<ShardId>,
        parents: &[&str],
        hash_key_range: HashKeyRange,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids: parents.iter().map(|p| ShardId::from(*p)).collect(),
            hash_key_range,
            status: ShardStatus::Open,
        }
    }

    /// Returns this shard marked closed.
    #[must_use]
    pub fn closed(mut self) -> Self {
        self.status = ShardStatus::Closed;
        self
    }

    /// Returns `true` if the shard no longer accepts writes.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == ShardStatus::Closed
    }
}

/// Discriminant of a [`StartingPosition`], used in the checkpoint layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PositionKind {
    /// Oldest record still retained.
    TrimHorizon = 0,
    /// Only records arriving after the iterator is created.
    Latest = 1,
    /// Strictly after a given sequence number.
    SequenceNumber = 2,
    /// First record at or after an arrival timestamp.
    Timestamp = 3,
}

impl PositionKind {
    /// Map a checkpoint tag back to a kind.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::TrimHorizon),
            1 => Some(Self::Latest),
            2 => Some(Self::SequenceNumber),
            3 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// Where reading of a shard starts (or resumes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StartingPosition {
    /// Oldest record still retained by the service.
    TrimHorizon,
    /// Records written after the iterator is created.
    Latest,
    /// Records strictly after this sequence number.
    AfterSequenceNumber(SequenceNumber),
    /// Records with an arrival timestamp at or after this epoch-millis value.
    AtTimestamp(i64),
}

impl StartingPosition {
    /// Position that resumes right after `sequence_number`.
    #[must_use]
    pub fn continue_after(sequence_number: SequenceNumber) -> Self {
        Self::AfterSequenceNumber(sequence_number)
    }

    /// Returns the checkpoint discriminant.
    #[must_use]
    pub fn kind(&self) -> PositionKind {
        match self {
            Self::TrimHorizon => PositionKind::TrimHorizon,
            Self::Latest => PositionKind::Latest,
            Self::AfterSequenceNumber(_) => PositionKind::SequenceNumber,
            Self::AtTimestamp(_) => PositionKind::Timestamp,
        }
    }

    /// Returns the last consumed sequence number, if any.
    #[must_use]
    pub fn sequence_number(&self) -> Option<&SequenceNumber> {
        match self {
            Self::AfterSequenceNumber(seq) => Some(seq),
            _ => None,
        }
    }
}

impl fmt::Display for StartingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrimHorizon => f.write_str("TRIM_HORIZON"),
            Self::Latest => f.write_str("LATEST"),
            Self::AfterSequenceNumber(seq) => write!(f, "AFTER_SEQUENCE_NUMBER({seq})"),
            Self::AtTimestamp(ts) => write!(f, "AT_TIMESTAMP({ts})"),
        }
    }
}

/// A unit of assignable work: one shard of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardSplit {
    /// Stream the shard belongs to.
    pub stream_arn: String,
    /// Shard to read.
    pub shard_id: ShardId,
    /// Position reading starts from.
    pub starting_position: StartingPosition,
    /// Parents of the shard, kept for lineage bookkeeping.
    pub parent_shard_ids: Vec<ShardId>,
}

impl ShardSplit {
    /// Create a new split.
    #[must_use]
    pub fn new(
        stream_arn: impl Into<String>,
        shard_id: impl Into<ShardId>,
        starting_position: StartingPosition,
    ) -> Self {
        Self {
            stream_arn: stream_arn.into(),
            shard_id: shard_id.into(),
            starting_position,
            parent_shard_ids: Vec::new(),
        }
    }

    /// Attach parent shard ids.
    #[must_use]
    pub fn with_parents(mut self, parents: Vec<ShardId>) -> Self {
        self.parent_shard_ids = parents;
        self
    }

    /// The split identifier, which is the shard identifier.
    #[must_use]
    pub fn split_id(&self) -> &ShardId {
        &self.shard_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_number_numeric_order() {
        let small = SequenceNumber::from("9");
        let large = SequenceNumber::from("10");
        assert!(small < large);

        let a = SequenceNumber::from("49590338271490256608559692538361571095921575989136588898");
        let b = SequenceNumber::from("49590338271490256608559692538361571095921575989136588899");
        assert!(a < b);
        assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_sequence_number_leading_zeros_normalized() {
        assert_eq!(SequenceNumber::from("00042"), SequenceNumber::from(42u64));
        assert_eq!(SequenceNumber::from("000").as_str(), "0");
    }

    #[test]
    fn test_hash_key_range_halves() {
        let (lo, hi) = HashKeyRange::FULL.halves();
        assert_eq!(lo.start, 0);
        assert_eq!(hi.end, u128::MAX);
        assert!(lo.is_adjacent_to(&hi));
        assert!(!hi.is_adjacent_to(&lo));
    }

    #[test]
    fn test_starting_position_kind() {
        assert_eq!(StartingPosition::TrimHorizon.kind(), PositionKind::TrimHorizon);
        assert_eq!(StartingPosition::Latest.kind(), PositionKind::Latest);
        let pos = StartingPosition::continue_after(SequenceNumber::from(42u64));
        assert_eq!(pos.kind(), PositionKind::SequenceNumber);
        assert_eq!(pos.sequence_number(), Some(&SequenceNumber::from(42u64)));
        assert_eq!(StartingPosition::AtTimestamp(5).kind(), PositionKind::Timestamp);
        for tag in 0..4u8 {
            assert_eq!(PositionKind::from_tag(tag).map(|k| k as u8), Some(tag));
        }
        assert_eq!(PositionKind::from_tag(4), None);
    }

    #[test]
    fn test_shard_builders() {
        let parent = Shard::root("shard-1", HashKeyRange::FULL).closed();
        assert!(parent.is_closed());
        let child = Shard::child("shard-2", &["shard-1"], HashKeyRange::FULL);
        assert_eq!(child.parent_shard_ids, vec![ShardId::new("shard-1")]);
        assert_eq!(child.status, ShardStatus::Open);
    }

    #[test]
    fn test_starting_position_serde() {
        let pos = StartingPosition::AfterSequenceNumber(SequenceNumber::from(7u64));
        let json = serde_json::to_string(&pos).unwrap();
        let back: StartingPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }
}
