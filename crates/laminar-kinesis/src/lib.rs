//! # `LaminarDB` Kinesis Source
//!
//! Exactly-once source connector for sharded, append-only record streams
//! with Kinesis semantics.
//!
//! Shards split and merge over time. The source tracks their lineage so a
//! child shard is never read before all of its parents are drained, which
//! keeps per-partition-key order across resharding. Splits are spread over
//! a fixed number of readers; a consistent checkpoint of the enumerator and
//! every reader allows resuming without loss or duplication, also with a
//! different number of readers.
//!
//! ## Layout
//!
//! - [`enumerator`]: shard discovery, lineage and assignment
//! - [`reader`]: per-worker fetching with backoff and cursor recovery
//! - [`checkpoint`]: versioned binary state
//! - [`source`]: runtime harness and the checkpoint protocol
//!
//! The stream service itself is reached through [`proxy::StreamProxy`];
//! [`testing::MockStreamProxy`] is an in-memory implementation.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
mod macros;

/// Shard assignment policies
pub mod assigner;

/// Exponential backoff with jitter
pub mod backoff;

/// Checkpoint state and its binary encoding
pub mod checkpoint;

/// Connector configuration
pub mod config;

/// Record deserialization and delivery
pub mod emitter;

/// Shard discovery and split assignment
pub mod enumerator;

/// Error types
pub mod error;

/// Reader and enumerator counters
pub mod metrics;

/// Stream service client abstraction
pub mod proxy;

/// Split readers
pub mod reader;

/// Shard, position and split types
pub mod shard;

/// Source runtime
pub mod source;

/// Test doubles for the stream service
pub mod testing;

pub use checkpoint::{ReaderCheckpoint, SourceCheckpoint, SplitCheckpoint};
pub use config::{AssignerKind, ConnectorConfig, KinesisSourceConfig, StartingPositionKind};
pub use emitter::{KinesisRecord, RecordDeserializer, RecordMetadata, RecordOutput};
pub use error::{CheckpointError, ConnectorError, ProxyError};
pub use proxy::StreamProxy;
pub use shard::{SequenceNumber, Shard, ShardId, ShardSplit, StartingPosition, WorkerId};
pub use source::{KinesisSource, KinesisSourceBuilder, SourceEvent};
