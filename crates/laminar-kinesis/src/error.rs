//! Error types for the Kinesis source connector.
//!
//! Three layers of errors exist:
//!
//! - [`ProxyError`]: failures reported by the stream service client. These
//!   are classified as retriable or not; retriable ones never leave the
//!   component that observed them unless the retry budget runs out.
//! - [`CheckpointError`]: failures decoding persisted state.
//! - [`ConnectorError`]: the error returned by every public operation.

use thiserror::Error;

use crate::shard::ShardId;

/// Errors reported by a [`StreamProxy`](crate::proxy::StreamProxy).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// The service rejected the call because a throughput quota was exceeded.
    #[error("throughput exceeded: {0}")]
    Throttled(String),

    /// Temporary network or service failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The iterator token expired. The position it was derived from may
    /// still be valid.
    #[error("shard iterator expired: {0}")]
    ExpiredIterator(String),

    /// The requested position can no longer be resolved (e.g. the sequence
    /// number fell out of the retention window).
    #[error("position is no longer resolvable: {0}")]
    InvalidPosition(String),

    /// The stream or shard does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other non-retriable failure.
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Returns `true` if the call may succeed when retried after a delay.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transient(_))
    }

    /// Returns `true` if the service reported a quota violation.
    #[must_use]
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

/// Errors decoding checkpointed state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// The version tag is not one this build knows how to read.
    #[error("unsupported checkpoint version {found} (max supported {supported})")]
    UnsupportedVersion {
        /// Version tag found in the bytes.
        found: u8,
        /// Highest version this build can read.
        supported: u8,
    },

    /// The input ended in the middle of a field.
    #[error("checkpoint truncated while reading {0}")]
    Truncated(&'static str),

    /// A field held a value outside its domain.
    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),

    /// The decoded state violates a structural invariant.
    #[error("checkpoint violates invariant: {0}")]
    InvariantViolation(String),
}

/// Errors returned by the Kinesis source connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// An option has an invalid value.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A required option is absent.
    #[error("Missing required config: {0}")]
    MissingConfig(String),

    /// The shard listing describes a lineage that cannot be ordered safely.
    #[error("Invalid stream topology: {0}")]
    InvalidTopology(String),

    /// A split's position is no longer resolvable by the service.
    #[error("Stale cursor for shard {shard_id}: {reason}")]
    StaleCursor {
        /// Shard whose position was rejected.
        shard_id: ShardId,
        /// Service-provided reason.
        reason: String,
    },

    /// A transient failure persisted past the retry budget.
    #[error("Retries exhausted for shard {shard_id} after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Shard being fetched.
        shard_id: ShardId,
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        last: ProxyError,
    },

    /// Non-retriable stream service failure.
    #[error("Stream service error: {0}")]
    Proxy(#[from] ProxyError),

    /// Checkpoint bytes could not be decoded.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A record could not be turned into an application value.
    #[error("Failed to deserialize record {sequence_number} of shard {shard_id}: {reason}")]
    Deserialization {
        /// Shard of the record.
        shard_id: ShardId,
        /// Sequence number of the record.
        sequence_number: String,
        /// Deserializer message.
        reason: String,
    },

    /// An operation was invoked in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The assigner chose a worker that is not registered.
    #[error("Assigner returned unknown worker {0}")]
    UnknownWorker(String),

    /// A peer task dropped its end of a channel.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A spawned task panicked or was aborted.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl ConnectorError {
    /// Returns true if this error indicates a transient failure that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Proxy(e) if e.is_retriable())
    }

    /// Returns true if the job must fail rather than continue with this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ProxyError::Throttled("x".into()).is_retriable());
        assert!(ProxyError::Transient("x".into()).is_retriable());
        assert!(!ProxyError::ExpiredIterator("x".into()).is_retriable());
        assert!(!ProxyError::InvalidPosition("x".into()).is_retriable());
        assert!(!ProxyError::ResourceNotFound("x".into()).is_retriable());
    }

    #[test]
    fn test_connector_error_fatality() {
        let transient = ConnectorError::Proxy(ProxyError::Throttled("slow down".into()));
        assert!(transient.is_transient());
        assert!(!transient.is_fatal());

        let stale = ConnectorError::StaleCursor {
            shard_id: ShardId::new("shardId-000000000001"),
            reason: "trimmed".into(),
        };
        assert!(stale.is_fatal());

        let decode: ConnectorError = CheckpointError::UnsupportedVersion {
            found: 9,
            supported: 1,
        }
        .into();
        assert!(decode.is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = ConnectorError::MissingConfig("stream.arn".into());
        assert_eq!(err.to_string(), "Missing required config: stream.arn");

        let err = CheckpointError::UnsupportedVersion {
            found: 7,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported checkpoint version 7 (max supported 1)"
        );
    }
}
