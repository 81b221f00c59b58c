//! Enumerator state: the shard graph plus per-shard progress.
//!
//! Each known shard carries exactly one [`ShardProgress`], so a shard can
//! never be pending, assigned and finished at the same time.

use std::collections::BTreeMap;

use crate::shard::{ShardId, ShardStatus, StartingPosition, WorkerId};

/// Where a known shard stands in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardProgress {
    /// Discovered, but at least one parent is not finished yet.
    AwaitingParents {
        /// Where reading starts once every parent has finished.
        start: StartingPosition,
    },
    /// Eligible for assignment; reading starts at the given position.
    Pending(StartingPosition),
    /// Owned by a reader. `position` is where the reader was told to start.
    Assigned {
        /// Owning reader.
        worker: WorkerId,
        /// Position handed to the reader with the split.
        position: StartingPosition,
    },
    /// Drained by its reader.
    Finished,
}

impl ShardProgress {
    /// Returns `true` for [`ShardProgress::Finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns `true` for [`ShardProgress::AwaitingParents`].
    #[must_use]
    pub fn is_awaiting_parents(&self) -> bool {
        matches!(self, Self::AwaitingParents { .. })
    }
}

/// A shard the enumerator has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownShard {
    /// Parent shard ids, as listed.
    pub parent_shard_ids: Vec<ShardId>,
    /// Last status reported by discovery.
    pub status: ShardStatus,
    /// Lifecycle position.
    pub progress: ShardProgress,
}

/// Snapshot-able enumerator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumeratorState {
    pub(crate) shards: BTreeMap<ShardId, KnownShard>,
}

impl EnumeratorState {
    /// Empty state, as used by a fresh job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from its shard table.
    #[must_use]
    pub fn from_shards(shards: BTreeMap<ShardId, KnownShard>) -> Self {
        Self { shards }
    }

    /// Returns `true` if no shard has been discovered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Every known shard, in id order.
    #[must_use]
    pub fn shards(&self) -> &BTreeMap<ShardId, KnownShard> {
        &self.shards
    }

    /// Looks up one shard.
    #[must_use]
    pub fn shard(&self, shard_id: &ShardId) -> Option<&KnownShard> {
        self.shards.get(shard_id)
    }

    /// Shards waiting for assignment, with their starting positions.
    pub fn pending(&self) -> impl Iterator<Item = (&ShardId, &StartingPosition)> {
        self.shards.iter().filter_map(|(id, s)| match &s.progress {
            ShardProgress::Pending(pos) => Some((id, pos)),
            _ => None,
        })
    }

    /// Assigned shards and their owners.
    pub fn assignments(&self) -> impl Iterator<Item = (&ShardId, WorkerId)> {
        self.shards.iter().filter_map(|(id, s)| match &s.progress {
            ShardProgress::Assigned { worker, .. } => Some((id, *worker)),
            _ => None,
        })
    }

    /// Shards drained to the end.
    pub fn finished(&self) -> impl Iterator<Item = &ShardId> {
        self.shards
            .iter()
            .filter(|(_, s)| s.progress.is_finished())
            .map(|(id, _)| id)
    }

    /// Shards withheld until their parents finish.
    pub fn awaiting_parents(&self) -> impl Iterator<Item = &ShardId> {
        self.shards
            .iter()
            .filter(|(_, s)| s.progress.is_awaiting_parents())
            .map(|(id, _)| id)
    }

    /// Returns `true` if every parent of `shard` is known and finished.
    #[must_use]
    pub fn parents_finished(&self, shard: &KnownShard) -> bool {
        shard.parent_shard_ids.iter().all(|p| {
            self.shards
                .get(p)
                .is_some_and(|parent| parent.progress.is_finished())
        })
    }

    /// Checks the structural invariants of the state.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation: a shard that lists
    /// itself or more than two parents, an unknown parent, a non-waiting
    /// child of an unfinished parent, or a waiting shard whose parents
    /// have all finished.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (id, shard) in &self.shards {
            if shard.parent_shard_ids.len() > 2 {
                return Err(format!("shard {id} lists {} parents", shard.parent_shard_ids.len()));
            }
            if shard.parent_shard_ids.contains(id) {
                return Err(format!("shard {id} lists itself as parent"));
            }
            for parent in &shard.parent_shard_ids {
                if !self.shards.contains_key(parent) {
                    return Err(format!("shard {id} references unknown parent {parent}"));
                }
            }
            let ready = self.parents_finished(shard);
            match shard.progress {
                ShardProgress::AwaitingParents { .. } if ready => {
                    return Err(format!("shard {id} is waiting although its parents finished"));
                }
                ShardProgress::Pending(_)
                | ShardProgress::Assigned { .. }
                | ShardProgress::Finished
                    if !ready =>
                {
                    return Err(format!("shard {id} progressed before its parents finished"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn awaiting() -> ShardProgress {
        ShardProgress::AwaitingParents {
            start: StartingPosition::TrimHorizon,
        }
    }

    fn known(parents: &[&str], progress: ShardProgress) -> KnownShard {
        KnownShard {
            parent_shard_ids: parents.iter().map(|p| ShardId::from(*p)).collect(),
            status: ShardStatus::Open,
            progress,
        }
    }

    #[test]
    fn test_views_partition_shards() {
        let mut shards = BTreeMap::new();
        shards.insert(ShardId::new("a"), known(&[], ShardProgress::Finished));
        shards.insert(
            ShardId::new("b"),
            known(&["a"], ShardProgress::Pending(StartingPosition::TrimHorizon)),
        );
        shards.insert(
            ShardId::new("c"),
            known(
                &["a"],
                ShardProgress::Assigned {
                    worker: WorkerId(1),
                    position: StartingPosition::TrimHorizon,
                },
            ),
        );
        shards.insert(ShardId::new("d"), known(&["c"], awaiting()));
        let state = EnumeratorState::from_shards(shards);

        assert_eq!(state.finished().count(), 1);
        assert_eq!(state.pending().count(), 1);
        assert_eq!(state.assignments().collect::<Vec<_>>(), vec![(&ShardId::new("c"), WorkerId(1))]);
        assert_eq!(state.awaiting_parents().count(), 1);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_invariant_violations() {
        let mut shards = BTreeMap::new();
        shards.insert(ShardId::new("a"), known(&[], awaiting()));
        let state = EnumeratorState::from_shards(shards);
        assert!(state.check_invariants().is_err());

        let mut shards = BTreeMap::new();
        shards.insert(ShardId::new("a"), known(&[], ShardProgress::Pending(StartingPosition::Latest)));
        shards.insert(ShardId::new("b"), known(&["a"], ShardProgress::Finished));
        let state = EnumeratorState::from_shards(shards);
        assert!(state.check_invariants().is_err());

        let mut shards = BTreeMap::new();
        shards.insert(ShardId::new("b"), known(&["zz"], awaiting()));
        let state = EnumeratorState::from_shards(shards);
        assert!(state.check_invariants().is_err());
    }
}
