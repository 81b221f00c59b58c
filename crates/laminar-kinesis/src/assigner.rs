//! Shard assignment policies.
//!
//! An assigner is a pure function from a candidate split and a snapshot of
//! the current assignment to the worker that should read it. The enumerator
//! validates the answer; assigners never mutate state or perform I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::AssignerKind;
use crate::error::ConnectorError;
use crate::shard::{ShardId, ShardSplit, WorkerId};

/// Read-only snapshot of which worker reads which shards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentView {
    active: BTreeMap<WorkerId, BTreeSet<ShardId>>,
    eligible: BTreeSet<WorkerId>,
}

impl AssignmentView {
    /// Empty view with no workers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker with its active shards. `has_capacity` marks whether it
    /// may receive another split.
    pub fn insert_worker(
        &mut self,
        worker: WorkerId,
        shards: BTreeSet<ShardId>,
        has_capacity: bool,
    ) {
        self.active.insert(worker, shards);
        if has_capacity {
            self.eligible.insert(worker);
        } else {
            self.eligible.remove(&worker);
        }
    }

    /// Builder-style [`insert_worker`](Self::insert_worker) for an
    /// unbounded worker.
    #[must_use]
    pub fn with_worker<I, S>(mut self, worker: WorkerId, shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ShardId>,
    {
        let shards = shards.into_iter().map(Into::into).collect();
        self.insert_worker(worker, shards, true);
        self
    }

    /// Every registered worker, in id order.
    pub fn known_workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.active.keys().copied()
    }

    /// Workers that may receive another split, in id order.
    pub fn eligible_workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.eligible.iter().copied()
    }

    /// Returns `true` if `worker` is registered and has spare capacity.
    #[must_use]
    pub fn is_eligible(&self, worker: WorkerId) -> bool {
        self.eligible.contains(&worker)
    }

    /// Number of active splits of `worker`.
    #[must_use]
    pub fn active_splits(&self, worker: WorkerId) -> usize {
        self.active.get(&worker).map_or(0, BTreeSet::len)
    }

    /// Shards currently read by `worker`.
    #[must_use]
    pub fn shards_of(&self, worker: WorkerId) -> Option<&BTreeSet<ShardId>> {
        self.active.get(&worker)
    }
}

/// Policy choosing the worker for a newly eligible split.
pub trait ShardAssigner: Send + Sync + std::fmt::Debug {
    /// Picks a worker among `view`'s eligible workers.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidState` if the view has no eligible
    /// worker.
    fn assign(&self, split: &ShardSplit, view: &AssignmentView) -> Result<WorkerId, ConnectorError>;
}

fn no_eligible_worker(split: &ShardSplit) -> ConnectorError {
    ConnectorError::InvalidState {
        expected: "at least one worker with spare capacity".into(),
        actual: format!("none available for shard {}", split.shard_id),
    }
}

/// Gives each split to the worker with the fewest active splits; ties go to
/// the lowest worker id.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformShardAssigner;

impl ShardAssigner for UniformShardAssigner {
    fn assign(&self, split: &ShardSplit, view: &AssignmentView) -> Result<WorkerId, ConnectorError> {
        view.eligible_workers()
            .min_by_key(|w| (view.active_splits(*w), *w))
            .ok_or_else(|| no_eligible_worker(split))
    }
}

/// Maps a shard to a worker by hashing its id over all known workers; the
/// same shard and worker set always give the same answer, whatever the
/// load.
///
/// If the hashed worker is full, the next worker in id order with spare
/// capacity takes the split, wrapping around.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashShardAssigner;

impl ShardAssigner for HashShardAssigner {
    #[allow(clippy::cast_possible_truncation)]
    fn assign(&self, split: &ShardSplit, view: &AssignmentView) -> Result<WorkerId, ConnectorError> {
        let workers: Vec<WorkerId> = view.known_workers().collect();
        if workers.is_empty() {
            return Err(no_eligible_worker(split));
        }
        let hash = xxhash_rust::xxh3::xxh3_64(split.shard_id.as_str().as_bytes());
        let home = (hash % workers.len() as u64) as usize;
        workers
            .iter()
            .cycle()
            .skip(home)
            .take(workers.len())
            .copied()
            .find(|w| view.is_eligible(*w))
            .ok_or_else(|| no_eligible_worker(split))
    }
}

/// Builds the built-in assigner for `kind`.
#[must_use]
pub fn create_assigner(kind: AssignerKind) -> Arc<dyn ShardAssigner> {
    match kind {
        AssignerKind::Uniform => Arc::new(UniformShardAssigner),
        AssignerKind::Hash => Arc::new(HashShardAssigner),
    }
}
