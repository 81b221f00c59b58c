//! Tokio task driving one [`SplitReader`].
//!
//! The task owns its reader exclusively. Commands (new splits, snapshot
//! requests) arrive on an unbounded channel and are processed in the order
//! they were sent, so a snapshot always reflects every split assigned
//! before it was requested.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::SplitReader;
use crate::checkpoint::ReaderCheckpoint;
use crate::emitter::RecordOutput;
use crate::enumerator::EnumeratorHandle;
use crate::error::ConnectorError;
use crate::metrics::ReaderMetrics;
use crate::shard::{ShardSplit, WorkerId};

/// Messages a reader task accepts.
#[derive(Debug)]
pub enum ReaderCommand {
    /// Take ownership of new splits.
    AddSplits(Vec<ShardSplit>),
    /// Capture split positions and mark the output with a barrier.
    Snapshot {
        /// Id of the checkpoint being taken.
        checkpoint_id: u64,
        /// Receives the captured positions.
        reply: oneshot::Sender<ReaderCheckpoint>,
    },
}

/// Handle returned when a reader task is spawned.
#[derive(Debug)]
pub struct ReaderHandle {
    /// Worker id of the reader.
    pub worker: WorkerId,
    /// Command mailbox.
    pub commands: mpsc::UnboundedSender<ReaderCommand>,
    /// Per-reader metrics (lock-free atomic reads).
    pub metrics: Arc<ReaderMetrics>,
    /// Task join handle.
    pub join: JoinHandle<Result<(), ConnectorError>>,
}

impl ReaderHandle {
    /// Requests a snapshot and waits for it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ChannelClosed` if the task has stopped.
    pub async fn snapshot(&self, checkpoint_id: u64) -> Result<ReaderCheckpoint, ConnectorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ReaderCommand::Snapshot {
                checkpoint_id,
                reply,
            })
            .map_err(|_| ConnectorError::ChannelClosed(format!("reader {}", self.worker)))?;
        rx.await
            .map_err(|_| ConnectorError::ChannelClosed(format!("reader {}", self.worker)))
    }
}

/// Spawns a task that polls `reader`'s splits into `output`.
///
/// The task registers the reader with the enumerator, reports drained
/// splits back to it, and runs until `cancel` fires or a fatal error
/// occurs. On a fatal error `cancel` is triggered so the rest of the
/// source stops too.
#[must_use]
pub fn spawn_reader<T, O>(
    mut reader: SplitReader<T>,
    initial_splits: Vec<ShardSplit>,
    mut output: O,
    enumerator: EnumeratorHandle,
    cancel: CancellationToken,
) -> ReaderHandle
where
    T: Send + 'static,
    O: RecordOutput<T> + 'static,
{
    let worker = reader.worker();
    let metrics = reader.metrics();
    let (tx, mut rx) = mpsc::unbounded_channel();
    reader.add_splits(initial_splits);
    let mailbox = tx.clone();

    let join = tokio::spawn(async move {
        if let Err(e) = enumerator.register_worker(worker, mailbox) {
            cancel.cancel();
            return Err(e);
        }
        tracing::debug!(worker = %worker, "Reader task started");

        let result = loop {
            let due = reader.next_due();
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!(worker = %worker, "Reader task shutdown");
                    break Ok(());
                }

                cmd = rx.recv() => match cmd {
                    Some(ReaderCommand::AddSplits(splits)) => reader.add_splits(splits),
                    Some(ReaderCommand::Snapshot { checkpoint_id, reply }) => {
                        let checkpoint = reader.snapshot();
                        if let Err(e) = output.barrier(worker, checkpoint_id).await {
                            break Err(e);
                        }
                        let _ = reply.send(checkpoint);
                    }
                    None => break Ok(()),
                },

                () = wait_until(due) => {
                    match reader.poll_due(&mut output).await {
                        Ok(finished) => {
                            for shard_id in finished {
                                if let Err(e) = enumerator.split_finished(worker, shard_id) {
                                    tracing::debug!(worker = %worker, error = %e, "enumerator gone");
                                }
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = &result {
            tracing::error!(worker = %worker, error = %e, "Reader task failed");
            cancel.cancel();
        }
        result
    });

    ReaderHandle {
        worker,
        commands: tx,
        metrics,
        join,
    }
}

/// Sleeps until `due`, or forever when no split is owned.
async fn wait_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
