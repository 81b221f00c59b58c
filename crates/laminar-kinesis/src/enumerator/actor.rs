//! Tokio actor owning the [`ShardEnumerator`].
//!
//! All state transitions happen on the actor task, one command at a time.
//! Shard listing runs on a separate task and reports back through the same
//! mailbox, so a slow listing never holds up assignment handling.
//!
//! While paused the actor still answers snapshot requests but defers every
//! command that would change state, which keeps a checkpoint consistent
//! across the enumerator and all readers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ShardEnumerator, SplitAssignment};
use crate::backoff::Backoff;
use crate::config::KinesisSourceConfig;
use crate::enumerator::state::EnumeratorState;
use crate::error::{ConnectorError, ProxyError};
use crate::metrics::EnumeratorMetrics;
use crate::proxy::{list_all_shards, StreamProxy};
use crate::reader::ReaderCommand;
use crate::shard::{Shard, ShardId, ShardSplit, WorkerId};

/// Messages the enumerator actor accepts.
#[derive(Debug)]
pub enum EnumeratorCommand {
    /// A reader is ready; assignments for it go to `mailbox`.
    RegisterWorker {
        /// Reader id.
        worker: WorkerId,
        /// Reader command channel.
        mailbox: mpsc::UnboundedSender<ReaderCommand>,
    },
    /// A reader drained a split.
    SplitFinished {
        /// Reporting reader.
        worker: WorkerId,
        /// Drained shard.
        shard_id: ShardId,
    },
    /// A reader is gone; its splits return to pending.
    WorkerFailed {
        /// Failed reader.
        worker: WorkerId,
    },
    /// Splits handed back with the positions to resume from.
    AddSplitsBack {
        /// Returned splits.
        splits: Vec<ShardSplit>,
    },
    /// Stop applying state changes until [`Resume`](Self::Resume).
    Pause {
        /// Acknowledged once the actor is paused.
        ack: oneshot::Sender<()>,
    },
    /// Apply deferred commands and continue.
    Resume,
    /// Request a copy of the current state.
    Snapshot {
        /// Receives the state.
        reply: oneshot::Sender<EnumeratorState>,
    },
    /// Result of a background shard listing.
    DiscoveryCompleted(Result<Vec<Shard>, ProxyError>),
}

impl EnumeratorCommand {
    fn mutates_state(&self) -> bool {
        !matches!(
            self,
            Self::Pause { .. } | Self::Resume | Self::Snapshot { .. }
        )
    }
}

/// Cloneable handle to a running enumerator actor.
#[derive(Debug, Clone)]
pub struct EnumeratorHandle {
    tx: mpsc::UnboundedSender<EnumeratorCommand>,
    metrics: Arc<EnumeratorMetrics>,
}

impl EnumeratorHandle {
    fn send(&self, cmd: EnumeratorCommand) -> Result<(), ConnectorError> {
        self.tx
            .send(cmd)
            .map_err(|_| ConnectorError::ChannelClosed("enumerator".into()))
    }

    /// Shared metrics of the enumerator.
    #[must_use]
    pub fn metrics(&self) -> Arc<EnumeratorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Registers a reader.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub fn register_worker(
        &self,
        worker: WorkerId,
        mailbox: mpsc::UnboundedSender<ReaderCommand>,
    ) -> Result<(), ConnectorError> {
        self.send(EnumeratorCommand::RegisterWorker { worker, mailbox })
    }

    /// Reports a drained split.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub fn split_finished(&self, worker: WorkerId, shard_id: ShardId) -> Result<(), ConnectorError> {
        self.send(EnumeratorCommand::SplitFinished { worker, shard_id })
    }

    /// Reports a failed reader.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub fn worker_failed(&self, worker: WorkerId) -> Result<(), ConnectorError> {
        self.send(EnumeratorCommand::WorkerFailed { worker })
    }

    /// Returns splits with their resume positions.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub fn add_splits_back(&self, splits: Vec<ShardSplit>) -> Result<(), ConnectorError> {
        self.send(EnumeratorCommand::AddSplitsBack { splits })
    }

    /// Pauses state changes; returns once the actor acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub async fn pause(&self) -> Result<(), ConnectorError> {
        let (ack, rx) = oneshot::channel();
        self.send(EnumeratorCommand::Pause { ack })?;
        rx.await
            .map_err(|_| ConnectorError::ChannelClosed("enumerator".into()))
    }

    /// Resumes state changes.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub fn resume(&self) -> Result<(), ConnectorError> {
        self.send(EnumeratorCommand::Resume)
    }

    /// Captures the current state.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the actor has stopped.
    pub async fn snapshot(&self) -> Result<EnumeratorState, ConnectorError> {
        let (reply, rx) = oneshot::channel();
        self.send(EnumeratorCommand::Snapshot { reply })?;
        rx.await
            .map_err(|_| ConnectorError::ChannelClosed("enumerator".into()))
    }
}

struct EnumeratorActor {
    enumerator: ShardEnumerator,
    proxy: Arc<dyn StreamProxy>,
    mailboxes: BTreeMap<WorkerId, mpsc::UnboundedSender<ReaderCommand>>,
    self_tx: mpsc::UnboundedSender<EnumeratorCommand>,
    paused: bool,
    deferred: VecDeque<EnumeratorCommand>,
    discovery_interval: Duration,
    discovery_backoff: Backoff,
    discovery_in_flight: bool,
    next_discovery: Instant,
}

impl EnumeratorActor {
    fn handle(&mut self, cmd: EnumeratorCommand) -> Result<(), ConnectorError> {
        if self.paused && cmd.mutates_state() {
            self.deferred.push_back(cmd);
            return Ok(());
        }

        match cmd {
            EnumeratorCommand::RegisterWorker { worker, mailbox } => {
                self.mailboxes.insert(worker, mailbox);
                let assignments = self.enumerator.on_worker_registered(worker)?;
                self.dispatch(assignments)
            }
            EnumeratorCommand::SplitFinished { worker, shard_id } => {
                debug!(worker = %worker, shard_id = %shard_id, "split finished report");
                let assignments = self.enumerator.on_split_finished(&shard_id)?;
                self.dispatch(assignments)
            }
            EnumeratorCommand::WorkerFailed { worker } => {
                self.mailboxes.remove(&worker);
                self.enumerator.on_worker_failed(worker);
                let assignments = self.enumerator.assign_pending()?;
                self.dispatch(assignments)
            }
            EnumeratorCommand::AddSplitsBack { splits } => {
                self.enumerator.add_splits_back(splits);
                let assignments = self.enumerator.assign_pending()?;
                self.dispatch(assignments)
            }
            EnumeratorCommand::Pause { ack } => {
                self.paused = true;
                let _ = ack.send(());
                Ok(())
            }
            EnumeratorCommand::Resume => {
                self.paused = false;
                while !self.paused {
                    let Some(cmd) = self.deferred.pop_front() else {
                        break;
                    };
                    self.handle(cmd)?;
                }
                Ok(())
            }
            EnumeratorCommand::Snapshot { reply } => {
                let _ = reply.send(self.enumerator.snapshot_state());
                Ok(())
            }
            EnumeratorCommand::DiscoveryCompleted(result) => self.on_discovery(result),
        }
    }

    fn on_discovery(&mut self, result: Result<Vec<Shard>, ProxyError>) -> Result<(), ConnectorError> {
        self.discovery_in_flight = false;
        match result {
            Ok(shards) => {
                self.discovery_backoff.reset();
                self.next_discovery = Instant::now() + self.discovery_interval;
                self.enumerator.apply_discovery(shards)?;
                let assignments = self.enumerator.assign_pending()?;
                self.dispatch(assignments)
            }
            // Throttling never stops the source: once the attempt budget is
            // spent, listing is retried at the backoff ceiling.
            Err(e) if e.is_retriable() => {
                self.enumerator.metrics().record_discovery_failure();
                let delay = self
                    .discovery_backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.discovery_backoff.max_delay());
                warn!(
                    stream = %self.enumerator.stream_arn(),
                    attempt = self.discovery_backoff.attempt(),
                    exhausted = self.discovery_backoff.exhausted(),
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "shard discovery failed, backing off"
                );
                self.next_discovery = Instant::now() + delay;
                Ok(())
            }
            Err(e) => {
                self.enumerator.metrics().record_discovery_failure();
                error!(stream = %self.enumerator.stream_arn(), error = %e, "shard discovery failed");
                Err(ConnectorError::Proxy(e))
            }
        }
    }

    fn start_discovery(&mut self) {
        self.discovery_in_flight = true;
        let proxy = Arc::clone(&self.proxy);
        let stream_arn = self.enumerator.stream_arn().to_string();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = list_all_shards(proxy.as_ref(), &stream_arn).await;
            let _ = tx.send(EnumeratorCommand::DiscoveryCompleted(result));
        });
    }

    /// Sends assignments to their readers. A reader whose mailbox is closed
    /// is treated as failed and its work is assigned elsewhere.
    fn dispatch(&mut self, mut assignments: Vec<SplitAssignment>) -> Result<(), ConnectorError> {
        loop {
            let mut by_worker: BTreeMap<WorkerId, Vec<ShardSplit>> = BTreeMap::new();
            for a in assignments {
                by_worker.entry(a.worker).or_default().push(a.split);
            }

            let mut failed = Vec::new();
            for (worker, splits) in by_worker {
                let delivered = self
                    .mailboxes
                    .get(&worker)
                    .is_some_and(|m| m.send(ReaderCommand::AddSplits(splits)).is_ok());
                if !delivered {
                    failed.push(worker);
                }
            }
            if failed.is_empty() {
                return Ok(());
            }

            for worker in failed {
                warn!(worker = %worker, "reader mailbox closed");
                self.mailboxes.remove(&worker);
                self.enumerator.on_worker_failed(worker);
            }
            assignments = self.enumerator.assign_pending()?;
        }
    }
}

/// Spawns the enumerator actor.
///
/// The first discovery runs immediately, later ones every
/// `config.discovery_interval`. The actor stops when `cancel` fires or on a
/// fatal error, in which case it triggers `cancel` itself.
#[must_use]
pub fn spawn_enumerator(
    enumerator: ShardEnumerator,
    proxy: Arc<dyn StreamProxy>,
    config: &KinesisSourceConfig,
    cancel: CancellationToken,
) -> (EnumeratorHandle, JoinHandle<Result<(), ConnectorError>>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = EnumeratorHandle {
        tx: tx.clone(),
        metrics: enumerator.metrics(),
    };
    let mut actor = EnumeratorActor {
        enumerator,
        proxy,
        mailboxes: BTreeMap::new(),
        self_tx: tx,
        paused: false,
        deferred: VecDeque::new(),
        discovery_interval: config.discovery_interval,
        discovery_backoff: config.retry.backoff(),
        discovery_in_flight: false,
        next_discovery: Instant::now(),
    };

    let join = tokio::spawn(async move {
        info!(stream = %actor.enumerator.stream_arn(), "Enumerator started");
        let result = loop {
            let next = actor.next_discovery;
            let can_discover = !actor.discovery_in_flight;
            tokio::select! {
                biased;

                () = cancel.cancelled() => break Ok(()),

                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break Ok(()) };
                    if let Err(e) = actor.handle(cmd) {
                        break Err(e);
                    }
                }

                () = tokio::time::sleep_until(next), if can_discover => actor.start_discovery(),
            }
        };

        match &result {
            Ok(()) => debug!("Enumerator shutdown"),
            Err(e) => {
                error!(error = %e, "Enumerator failed");
                cancel.cancel();
            }
        }
        result
    });

    (handle, join)
}
