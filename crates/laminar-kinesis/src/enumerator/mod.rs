//! Shard discovery, lineage tracking and split assignment.
//!
//! [`ShardEnumerator`] is a synchronous state machine: every transition is
//! a method call that returns the assignments it produced. The tokio actor
//! in [`actor`] owns one and serializes all calls into it.

pub mod actor;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::assigner::{AssignmentView, ShardAssigner};
use crate::config::{KinesisSourceConfig, StartingPositionKind};
use crate::error::ConnectorError;
use crate::metrics::EnumeratorMetrics;
use crate::proxy::{list_all_shards, system_time_ms, StreamProxy};
use crate::shard::{Shard, ShardId, ShardSplit, ShardStatus, StartingPosition, WorkerId};

pub use actor::{spawn_enumerator, EnumeratorCommand, EnumeratorHandle};
pub use state::{EnumeratorState, KnownShard, ShardProgress};

/// A split handed to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitAssignment {
    /// Receiving reader.
    pub worker: WorkerId,
    /// Split to read.
    pub split: ShardSplit,
}

/// Outcome of applying one shard listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    /// Shards in the listing.
    pub listed: usize,
    /// Shards seen for the first time.
    pub new_shards: usize,
    /// New shards that became pending right away.
    pub new_pending: usize,
    /// Known shards whose status moved from open to closed.
    pub newly_closed: usize,
}

/// Coordinator of the shard graph.
#[derive(Debug)]
pub struct ShardEnumerator {
    stream_arn: String,
    starting_position: StartingPositionKind,
    initial_position: StartingPosition,
    later_position: StartingPosition,
    capacity: Option<usize>,
    assigner: Arc<dyn ShardAssigner>,
    state: EnumeratorState,
    workers: BTreeSet<WorkerId>,
    metrics: Arc<EnumeratorMetrics>,
}

impl ShardEnumerator {
    /// Create an enumerator, seeded from `restored` when resuming.
    ///
    /// A `LATEST` job starts at the current wall-clock time; use
    /// [`with_start_time`](Self::with_start_time) to take the time from the
    /// service instead.
    #[must_use]
    pub fn new(
        config: &KinesisSourceConfig,
        assigner: Arc<dyn ShardAssigner>,
        restored: Option<EnumeratorState>,
    ) -> Self {
        // Shards first seen after the initial listing were created after the
        // job started. Only a configured timestamp can still cut into them.
        let later_position = match config.starting_position {
            StartingPositionKind::AtTimestamp => config.initial_position(0),
            StartingPositionKind::TrimHorizon | StartingPositionKind::Latest => {
                StartingPosition::TrimHorizon
            }
        };
        Self {
            stream_arn: config.stream_arn.clone(),
            starting_position: config.starting_position,
            initial_position: config.initial_position(system_time_ms()),
            later_position,
            capacity: config.reader_capacity(),
            assigner,
            state: restored.unwrap_or_default(),
            workers: BTreeSet::new(),
            metrics: Arc::new(EnumeratorMetrics::default()),
        }
    }

    /// Pins the job start time used to resolve `LATEST`, in epoch millis on
    /// the service's arrival clock. Has no effect for other starting
    /// positions.
    #[must_use]
    pub fn with_start_time(mut self, start_time_ms: i64) -> Self {
        if self.starting_position == StartingPositionKind::Latest {
            self.initial_position = StartingPosition::AtTimestamp(start_time_ms);
        }
        self
    }

    /// Position shards of the first listing of a fresh job start from,
    /// directly or once their parents finish.
    #[must_use]
    pub fn initial_position(&self) -> &StartingPosition {
        &self.initial_position
    }

    /// Stream this enumerator discovers.
    #[must_use]
    pub fn stream_arn(&self) -> &str {
        &self.stream_arn
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<EnumeratorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current state, borrowed.
    #[must_use]
    pub fn state(&self) -> &EnumeratorState {
        &self.state
    }

    /// Registered workers.
    #[must_use]
    pub fn workers(&self) -> &BTreeSet<WorkerId> {
        &self.workers
    }

    /// Lists all shards and applies the result.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Proxy` if the listing fails and
    /// `ConnectorError::InvalidTopology` if it describes an impossible lineage.
    pub async fn discover(
        &mut self,
        proxy: &dyn StreamProxy,
    ) -> Result<DiscoverySummary, ConnectorError> {
        let shards = list_all_shards(proxy, &self.stream_arn).await?;
        self.apply_discovery(shards)
    }

    /// Merges a shard listing into the state.
    ///
    /// New shards with finished (or no) parents become pending, the rest
    /// wait for their parents. Known shards only have their status
    /// refreshed. Nothing is ever removed.
    ///
    /// Every shard of the first listing of a fresh job starts at the
    /// configured position, including children that wait for a parent
    /// listed alongside them. Parents absent from that listing have aged
    /// out of retention and are recorded as finished. On any later listing
    /// an unknown parent is a topology error.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidTopology` for a shard that lists
    /// itself, more than two parents, or an unknown parent. The state is
    /// left untouched in that case.
    pub fn apply_discovery(&mut self, shards: Vec<Shard>) -> Result<DiscoverySummary, ConnectorError> {
        let initial = self.state.is_empty();
        let listed_ids: HashSet<ShardId> = shards.iter().map(|s| s.shard_id.clone()).collect();

        for shard in &shards {
            if shard.parent_shard_ids.len() > 2 {
                return Err(self.topology_error(format!(
                    "shard {} lists {} parents",
                    shard.shard_id,
                    shard.parent_shard_ids.len()
                )));
            }
            if shard.parent_shard_ids.contains(&shard.shard_id) {
                return Err(
                    self.topology_error(format!("shard {} lists itself as parent", shard.shard_id))
                );
            }
            if !initial {
                if let Some(parent) = shard
                    .parent_shard_ids
                    .iter()
                    .find(|p| !listed_ids.contains(*p) && !self.state.shards.contains_key(*p))
                {
                    return Err(self.topology_error(format!(
                        "shard {} references unknown parent {parent}",
                        shard.shard_id
                    )));
                }
            }
        }

        let mut summary = DiscoverySummary {
            listed: shards.len(),
            ..DiscoverySummary::default()
        };
        let mut expired_parents: BTreeSet<ShardId> = BTreeSet::new();
        let start = if initial {
            self.initial_position.clone()
        } else {
            self.later_position.clone()
        };

        for shard in shards {
            if let Some(known) = self.state.shards.get_mut(&shard.shard_id) {
                if known.status == ShardStatus::Open && shard.status == ShardStatus::Closed {
                    known.status = ShardStatus::Closed;
                    summary.newly_closed += 1;
                }
                continue;
            }
            if initial {
                expired_parents.extend(
                    shard
                        .parent_shard_ids
                        .iter()
                        .filter(|p| !listed_ids.contains(*p))
                        .cloned(),
                );
            }
            summary.new_shards += 1;
            debug!(shard_id = %shard.shard_id, parents = ?shard.parent_shard_ids, "discovered shard");
            self.state.shards.insert(
                shard.shard_id,
                KnownShard {
                    parent_shard_ids: shard.parent_shard_ids,
                    status: shard.status,
                    progress: ShardProgress::AwaitingParents {
                        start: start.clone(),
                    },
                },
            );
        }

        for parent in expired_parents {
            info!(shard_id = %parent, "parent shard absent from initial listing, treating as finished");
            self.state.shards.insert(
                parent,
                KnownShard {
                    parent_shard_ids: Vec::new(),
                    status: ShardStatus::Closed,
                    progress: ShardProgress::Finished,
                },
            );
        }

        summary.new_pending = self.promote_ready();

        self.metrics.record_discovery(summary.new_shards);
        if summary.new_shards > 0 || summary.newly_closed > 0 {
            info!(
                stream = %self.stream_arn,
                listed = summary.listed,
                new_shards = summary.new_shards,
                new_pending = summary.new_pending,
                newly_closed = summary.newly_closed,
                "shard discovery applied"
            );
        }
        Ok(summary)
    }

    /// Moves waiting shards whose parents all finished to pending at their
    /// recorded start position and returns how many moved.
    fn promote_ready(&mut self) -> usize {
        // Promotion never cascades: a newly pending shard is not finished,
        // so one pass over the waiting shards is enough.
        let ready: Vec<ShardId> = self
            .state
            .shards
            .iter()
            .filter(|(_, s)| s.progress.is_awaiting_parents() && self.state.parents_finished(s))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ready {
            if let Some(shard) = self.state.shards.get_mut(id) {
                if let ShardProgress::AwaitingParents { start } = &shard.progress {
                    debug!(shard_id = %id, position = %start, "shard eligible for assignment");
                    shard.progress = ShardProgress::Pending(start.clone());
                }
            }
        }
        ready.len()
    }

    /// Assigns every pending shard to a worker with spare capacity.
    ///
    /// Stops early when no worker has capacity left; remaining shards stay
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::UnknownWorker` if the assigner picks a
    /// worker that is not registered or has no capacity left.
    pub fn assign_pending(&mut self) -> Result<Vec<SplitAssignment>, ConnectorError> {
        let pending: Vec<(ShardId, StartingPosition)> = self
            .state
            .pending()
            .map(|(id, pos)| (id.clone(), pos.clone()))
            .collect();
        if pending.is_empty() || self.workers.is_empty() {
            return Ok(Vec::new());
        }

        let mut active: BTreeMap<WorkerId, BTreeSet<ShardId>> =
            self.workers.iter().map(|w| (*w, BTreeSet::new())).collect();
        for (id, worker) in self.state.assignments() {
            if let Some(set) = active.get_mut(&worker) {
                set.insert(id.clone());
            }
        }
        let mut view = AssignmentView::new();
        for (worker, shards) in active {
            let has_capacity = self.has_capacity(shards.len());
            view.insert_worker(worker, shards, has_capacity);
        }

        let mut out = Vec::new();
        for (shard_id, position) in pending {
            if view.eligible_workers().next().is_none() {
                debug!(remaining = self.state.pending().count(), "no reader capacity left");
                break;
            }
            let Some(known) = self.state.shards.get(&shard_id) else {
                continue;
            };
            let split = ShardSplit::new(self.stream_arn.clone(), shard_id.clone(), position.clone())
                .with_parents(known.parent_shard_ids.clone());

            let worker = self.assigner.assign(&split, &view)?;
            if !view.is_eligible(worker) {
                error!(shard_id = %shard_id, worker = %worker, "assigner picked an ineligible worker");
                return Err(ConnectorError::UnknownWorker(worker.to_string()));
            }

            let mut shards = view.shards_of(worker).cloned().unwrap_or_default();
            shards.insert(shard_id.clone());
            let has_capacity = self.has_capacity(shards.len());
            view.insert_worker(worker, shards, has_capacity);

            if let Some(known) = self.state.shards.get_mut(&shard_id) {
                known.progress = ShardProgress::Assigned {
                    worker,
                    position: position.clone(),
                };
            }
            info!(shard_id = %shard_id, worker = %worker, %position, "assigned split");
            out.push(SplitAssignment { worker, split });
        }

        self.metrics.record_assignments(out.len());
        Ok(out)
    }

    fn has_capacity(&self, active: usize) -> bool {
        self.capacity.map_or(true, |cap| active < cap)
    }

    /// Marks a shard drained, unlocks its children and assigns whatever
    /// became eligible.
    ///
    /// Reports for unknown or already finished shards are ignored.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`assign_pending`](Self::assign_pending).
    pub fn on_split_finished(
        &mut self,
        shard_id: &ShardId,
    ) -> Result<Vec<SplitAssignment>, ConnectorError> {
        match self.state.shards.get_mut(shard_id) {
            None => {
                warn!(shard_id = %shard_id, "finish reported for unknown shard");
                return Ok(Vec::new());
            }
            Some(shard) if shard.progress.is_finished() => {
                debug!(shard_id = %shard_id, "duplicate finish report");
                return Ok(Vec::new());
            }
            Some(shard) => {
                shard.progress = ShardProgress::Finished;
                shard.status = ShardStatus::Closed;
                info!(shard_id = %shard_id, "split finished");
            }
        }
        self.promote_ready();
        self.assign_pending()
    }

    /// Registers a reader and assigns pending work.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`assign_pending`](Self::assign_pending).
    pub fn on_worker_registered(
        &mut self,
        worker: WorkerId,
    ) -> Result<Vec<SplitAssignment>, ConnectorError> {
        if self.workers.insert(worker) {
            info!(worker = %worker, "reader registered");
        }
        self.assign_pending()
    }

    /// Deregisters a reader and returns its unfinished shards to pending at
    /// the position they were assigned with. Returns the requeued ids.
    pub fn on_worker_failed(&mut self, worker: WorkerId) -> Vec<ShardId> {
        self.workers.remove(&worker);
        let mut requeued = Vec::new();
        for (id, shard) in &mut self.state.shards {
            if let ShardProgress::Assigned { worker: w, position } = &shard.progress {
                if *w == worker {
                    shard.progress = ShardProgress::Pending(position.clone());
                    requeued.push(id.clone());
                }
            }
        }
        warn!(worker = %worker, requeued = requeued.len(), "reader failed, splits returned to pending");
        requeued
    }

    /// Puts splits back into the pending set with the positions they carry.
    ///
    /// Splits of finished shards are dropped. Unknown shards are added; the
    /// next discovery refreshes their status.
    pub fn add_splits_back(&mut self, splits: Vec<ShardSplit>) {
        for split in splits {
            let ShardSplit {
                shard_id,
                starting_position,
                parent_shard_ids,
                ..
            } = split;
            match self.state.shards.get_mut(&shard_id) {
                Some(shard) if shard.progress.is_finished() => {
                    warn!(shard_id = %shard_id, "ignoring returned split of finished shard");
                }
                Some(shard) => {
                    debug!(shard_id = %shard_id, position = %starting_position, "split returned");
                    shard.progress = ShardProgress::Pending(starting_position);
                }
                None => {
                    debug!(shard_id = %shard_id, position = %starting_position, "unknown split returned");
                    self.state.shards.insert(
                        shard_id,
                        KnownShard {
                            parent_shard_ids,
                            status: ShardStatus::Open,
                            progress: ShardProgress::Pending(starting_position),
                        },
                    );
                }
            }
        }
    }

    /// Reconciles a restored state with the splits readers restored.
    ///
    /// `owned` maps every split found in a reader checkpoint to the worker
    /// that held it. An assigned shard no reader holds was drained between
    /// the reader and enumerator snapshots and becomes finished. Splits of
    /// `live` workers have their assignment position refreshed; splits of
    /// other workers are returned to pending with their positions.
    ///
    /// Returns the splits each live worker resumes with.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Checkpoint` if a reader holds a split the
    /// enumerator does not consider assigned to it.
    pub fn reconcile_restored(
        &mut self,
        owned: &BTreeMap<ShardId, (WorkerId, StartingPosition)>,
        live: &BTreeSet<WorkerId>,
    ) -> Result<BTreeMap<WorkerId, Vec<ShardSplit>>, ConnectorError> {
        for (shard_id, (worker, _)) in owned {
            match self.state.shards.get(shard_id).map(|s| &s.progress) {
                Some(ShardProgress::Assigned { worker: w, .. }) if w == worker => {}
                other => {
                    return Err(crate::error::CheckpointError::InvariantViolation(format!(
                        "reader {worker} holds shard {shard_id}, enumerator has {other:?}"
                    ))
                    .into());
                }
            }
        }

        let drained: Vec<ShardId> = self
            .state
            .assignments()
            .filter(|(id, _)| !owned.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &drained {
            if let Some(shard) = self.state.shards.get_mut(id) {
                info!(shard_id = %id, "assigned shard absent from reader state, marking finished");
                shard.progress = ShardProgress::Finished;
                shard.status = ShardStatus::Closed;
            }
        }

        let mut resumed: BTreeMap<WorkerId, Vec<ShardSplit>> = BTreeMap::new();
        let mut orphaned = Vec::new();
        for (shard_id, (worker, position)) in owned {
            let Some(shard) = self.state.shards.get_mut(shard_id) else {
                continue;
            };
            let split = ShardSplit::new(self.stream_arn.clone(), shard_id.clone(), position.clone())
                .with_parents(shard.parent_shard_ids.clone());
            if live.contains(worker) {
                shard.progress = ShardProgress::Assigned {
                    worker: *worker,
                    position: position.clone(),
                };
                resumed.entry(*worker).or_default().push(split);
            } else {
                orphaned.push(split);
            }
        }
        if !orphaned.is_empty() {
            info!(splits = orphaned.len(), "returning splits of removed readers to pending");
            self.add_splits_back(orphaned);
        }

        self.promote_ready();
        Ok(resumed)
    }

    /// Point-in-time copy of the state.
    #[must_use]
    pub fn snapshot_state(&self) -> EnumeratorState {
        self.state.clone()
    }

    fn topology_error(&self, msg: String) -> ConnectorError {
        error!(stream = %self.stream_arn, "{msg}");
        ConnectorError::InvalidTopology(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assigner::{create_assigner, UniformShardAssigner};
    use crate::config::{AssignerKind, StartingPositionKind};
    use crate::shard::HashKeyRange;

    fn config() -> KinesisSourceConfig {
        let mut cfg = KinesisSourceConfig::new("stream");
        cfg.starting_position = StartingPositionKind::Latest;
        cfg
    }

    fn enumerator() -> ShardEnumerator {
        ShardEnumerator::new(&config(), Arc::new(UniformShardAssigner), None)
    }

    fn ids(assignments: &[SplitAssignment]) -> Vec<&str> {
        assignments.iter().map(|a| a.split.shard_id.as_str()).collect()
    }

    #[test]
    fn test_latest_is_pinned_to_start_time() {
        let mut e = enumerator().with_start_time(1_700_000_000_500);
        e.apply_discovery(vec![Shard::root("s1", HashKeyRange::FULL)]).unwrap();
        let out = e.on_worker_registered(WorkerId(0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].split.starting_position,
            StartingPosition::AtTimestamp(1_700_000_000_500)
        );
    }

    #[test]
    fn test_latest_without_service_clock_uses_wall_clock() {
        let e = enumerator();
        assert!(matches!(e.initial_position(), StartingPosition::AtTimestamp(ts) if *ts > 0));
    }

    #[test]
    fn test_start_time_ignored_for_trim_horizon() {
        let mut cfg = config();
        cfg.starting_position = StartingPositionKind::TrimHorizon;
        let e = ShardEnumerator::new(&cfg, Arc::new(UniformShardAssigner), None).with_start_time(9);
        assert_eq!(e.initial_position(), &StartingPosition::TrimHorizon);
    }

    #[test]
    fn test_initial_listing_children_inherit_latest_start() {
        let mut e = enumerator().with_start_time(1_000);
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![
            Shard::root("s1", HashKeyRange::FULL).closed(),
            Shard::child("s2", &["s1"], lo),
            Shard::child("s3", &["s1"], hi),
        ])
        .unwrap();
        let out = e.on_worker_registered(WorkerId(0)).unwrap();
        assert_eq!(ids(&out), vec!["s1"]);
        assert_eq!(out[0].split.starting_position, StartingPosition::AtTimestamp(1_000));

        let out = e.on_split_finished(&ShardId::new("s1")).unwrap();
        assert_eq!(ids(&out), vec!["s2", "s3"]);
        assert!(out
            .iter()
            .all(|a| a.split.starting_position == StartingPosition::AtTimestamp(1_000)));
    }

    #[test]
    fn test_at_timestamp_applies_to_later_shards() {
        let mut cfg = config();
        cfg.starting_position = StartingPositionKind::AtTimestamp;
        cfg.starting_timestamp_ms = Some(4_000);
        let mut e = ShardEnumerator::new(&cfg, Arc::new(UniformShardAssigner), None);
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("s1", HashKeyRange::FULL)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        e.apply_discovery(vec![
            Shard::root("s1", HashKeyRange::FULL).closed(),
            Shard::child("s2", &["s1"], lo),
            Shard::child("s3", &["s1"], hi),
        ])
        .unwrap();

        let out = e.on_split_finished(&ShardId::new("s1")).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|a| a.split.starting_position == StartingPosition::AtTimestamp(4_000)));
    }

    #[test]
    fn test_restored_waiting_shard_keeps_its_start() {
        let mut e = enumerator().with_start_time(2_000);
        e.apply_discovery(vec![
            Shard::root("s1", HashKeyRange::FULL).closed(),
            Shard::child("s2", &["s1"], HashKeyRange::FULL),
        ])
        .unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        let snapshot = e.snapshot_state();

        let mut owned = BTreeMap::new();
        owned.insert(ShardId::new("s1"), (WorkerId(0), StartingPosition::AtTimestamp(2_000)));
        let mut restored = ShardEnumerator::new(&config(), Arc::new(UniformShardAssigner), Some(snapshot))
            .with_start_time(9_999);
        restored
            .reconcile_restored(&owned, &BTreeSet::from([WorkerId(0)]))
            .unwrap();
        restored.on_worker_registered(WorkerId(0)).unwrap();

        let out = restored.on_split_finished(&ShardId::new("s1")).unwrap();
        assert_eq!(ids(&out), vec!["s2"]);
        assert_eq!(out[0].split.starting_position, StartingPosition::AtTimestamp(2_000));
    }

    #[test]
    fn test_later_shards_start_at_trim_horizon() {
        let mut e = enumerator();
        e.apply_discovery(vec![Shard::root("s1", HashKeyRange::new(0, 10))]).unwrap();
        e.apply_discovery(vec![
            Shard::root("s1", HashKeyRange::new(0, 10)),
            Shard::root("s9", HashKeyRange::new(11, 20)),
        ])
        .unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        let pos = match &e.state().shard(&ShardId::new("s9")).unwrap().progress {
            ShardProgress::Assigned { position, .. } => position.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(pos, StartingPosition::TrimHorizon);
    }

    #[test]
    fn test_split_children_wait_for_parent() {
        let mut e = enumerator();
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("s1", HashKeyRange::FULL)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        e.on_worker_registered(WorkerId(1)).unwrap();

        let summary = e
            .apply_discovery(vec![
                Shard::root("s1", HashKeyRange::FULL).closed(),
                Shard::child("s2", &["s1"], lo),
                Shard::child("s3", &["s1"], hi),
            ])
            .unwrap();
        assert_eq!(summary.new_shards, 2);
        assert_eq!(summary.new_pending, 0);
        assert_eq!(summary.newly_closed, 1);
        assert_eq!(e.assign_pending().unwrap(), vec![]);
        assert_eq!(e.state().awaiting_parents().count(), 2);

        let out = e.on_split_finished(&ShardId::new("s1")).unwrap();
        assert_eq!(ids(&out), vec!["s2", "s3"]);
        assert!(out
            .iter()
            .all(|a| a.split.starting_position == StartingPosition::TrimHorizon));
        assert_eq!(out[0].split.parent_shard_ids, vec![ShardId::new("s1")]);
        assert!(e.state().check_invariants().is_ok());
    }

    #[test]
    fn test_merge_child_waits_for_both_parents() {
        let mut e = enumerator();
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("a", lo), Shard::root("b", hi)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        e.apply_discovery(vec![
            Shard::root("a", lo).closed(),
            Shard::root("b", hi).closed(),
            Shard::child("c", &["a", "b"], HashKeyRange::FULL),
        ])
        .unwrap();

        assert!(e.on_split_finished(&ShardId::new("a")).unwrap().is_empty());
        let out = e.on_split_finished(&ShardId::new("b")).unwrap();
        assert_eq!(ids(&out), vec!["c"]);
    }

    #[test]
    fn test_expired_parents_treated_finished_on_initial_listing() {
        let mut e = enumerator();
        e.apply_discovery(vec![Shard::child("s5", &["gone"], HashKeyRange::FULL)])
            .unwrap();
        assert!(e.state().shard(&ShardId::new("gone")).unwrap().progress.is_finished());
        assert_eq!(e.state().pending().count(), 1);
        assert!(e.state().check_invariants().is_ok());
    }

    #[test]
    fn test_unknown_parent_later_is_fatal() {
        let mut e = enumerator();
        e.apply_discovery(vec![Shard::root("s1", HashKeyRange::FULL)]).unwrap();
        let before = e.snapshot_state();
        let err = e
            .apply_discovery(vec![Shard::child("s2", &["nope"], HashKeyRange::FULL)])
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidTopology(_)));
        assert_eq!(e.snapshot_state(), before);
    }

    #[test]
    fn test_bad_parentage_is_fatal() {
        let mut e = enumerator();
        let err = e
            .apply_discovery(vec![Shard::child("s1", &["s1"], HashKeyRange::FULL)])
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidTopology(_)));

        let err = e
            .apply_discovery(vec![Shard::child("s4", &["a", "b", "c"], HashKeyRange::FULL)])
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidTopology(_)));
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let mut e = enumerator();
        let listing = vec![Shard::root("s1", HashKeyRange::FULL)];
        e.apply_discovery(listing.clone()).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        let summary = e.apply_discovery(listing).unwrap();
        assert_eq!(summary.new_shards, 0);
        assert!(e.assign_pending().unwrap().is_empty());
        assert_eq!(e.state().assignments().count(), 1);
    }

    #[test]
    fn test_capacity_limits_assignment() {
        let mut cfg = config();
        cfg.max_splits_per_reader = 1;
        let mut e = ShardEnumerator::new(&cfg, create_assigner(AssignerKind::Uniform), None);
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("a", lo), Shard::root("b", hi)]).unwrap();
        let out = e.on_worker_registered(WorkerId(0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(e.state().pending().count(), 1);
        let out = e.on_worker_registered(WorkerId(1)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].worker, WorkerId(1));
    }

    #[test]
    fn test_worker_failure_requeues() {
        let mut e = enumerator();
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("a", lo), Shard::root("b", hi)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        let requeued = e.on_worker_failed(WorkerId(0));
        assert_eq!(requeued.len(), 2);
        assert_eq!(e.state().pending().count(), 2);
        assert!(e.assign_pending().unwrap().is_empty());

        let out = e.on_worker_registered(WorkerId(1)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.worker == WorkerId(1)));
    }

    #[test]
    fn test_add_splits_back_keeps_position() {
        let mut e = enumerator();
        e.apply_discovery(vec![Shard::root("a", HashKeyRange::FULL)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        e.on_worker_failed(WorkerId(0));
        let pos = StartingPosition::continue_after(42u64.into());
        e.add_splits_back(vec![ShardSplit::new("stream", "a", pos.clone())]);
        let out = e.on_worker_registered(WorkerId(1)).unwrap();
        assert_eq!(out[0].split.starting_position, pos);
    }

    #[test]
    fn test_reconcile_restored() {
        let mut e = enumerator();
        let (lo, hi) = HashKeyRange::FULL.halves();
        e.apply_discovery(vec![Shard::root("a", lo), Shard::root("b", hi)]).unwrap();
        e.on_worker_registered(WorkerId(0)).unwrap();
        e.on_worker_registered(WorkerId(1)).unwrap();
        e.apply_discovery(vec![
            Shard::root("a", lo).closed(),
            Shard::root("b", hi),
            Shard::child("a1", &["a"], lo),
        ])
        .unwrap();
        let snapshot = e.snapshot_state();

        let worker_of = |id: &str| {
            snapshot
                .assignments()
                .find(|(s, _)| s.as_str() == id)
                .map(|(_, w)| w)
                .unwrap()
        };
        // "a" drained before the reader snapshot; "b" at seq 7 on a reader
        // that no longer exists after rescale.
        let mut owned = BTreeMap::new();
        owned.insert(
            ShardId::new("b"),
            (worker_of("b"), StartingPosition::continue_after(7u64.into())),
        );

        let mut restored =
            ShardEnumerator::new(&config(), Arc::new(UniformShardAssigner), Some(snapshot));
        let resumed = restored
            .reconcile_restored(&owned, &BTreeSet::from([WorkerId(5)]))
            .unwrap();
        assert!(resumed.is_empty());
        assert!(restored.state().shard(&ShardId::new("a")).unwrap().progress.is_finished());
        let pending: BTreeMap<_, _> = restored.state().pending().collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(
            pending[&ShardId::new("b")],
            &StartingPosition::continue_after(7u64.into())
        );
        assert_eq!(pending[&ShardId::new("a1")], &StartingPosition::TrimHorizon);
        assert!(restored.state().check_invariants().is_ok());
    }

    #[test]
    fn test_reconcile_rejects_foreign_split() {
        let mut e = enumerator();
        e.apply_discovery(vec![Shard::root("a", HashKeyRange::FULL)]).unwrap();
        let mut owned = BTreeMap::new();
        owned.insert(ShardId::new("a"), (WorkerId(0), StartingPosition::Latest));
        let err = e.reconcile_restored(&owned, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, ConnectorError::Checkpoint(_)));
    }
}
