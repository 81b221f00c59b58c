//! Lock-free counters for readers and the enumerator.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-reader counters, shared between the reader task and observers.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    /// `getRecords` calls that returned successfully.
    pub fetches: AtomicU64,
    /// Successful fetches that returned no records.
    pub empty_fetches: AtomicU64,
    /// Records handed to the output.
    pub records_emitted: AtomicU64,
    /// Retries caused by throttling.
    pub throttled_retries: AtomicU64,
    /// Retries caused by other transient failures.
    pub transient_retries: AtomicU64,
    /// Iterator tokens refreshed after expiry.
    pub iterators_refreshed: AtomicU64,
    /// Splits drained to the end.
    pub splits_finished: AtomicU64,
    /// Most recent `millis_behind_latest` reported by any split.
    pub millis_behind_latest: AtomicU64,
}

impl ReaderMetrics {
    /// Records a successful fetch of `records` records.
    pub fn record_fetch(&self, records: usize, millis_behind_latest: Option<u64>) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if records == 0 {
            self.empty_fetches.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(lag) = millis_behind_latest {
            self.millis_behind_latest.store(lag, Ordering::Relaxed);
        }
    }

    /// Records one emitted record.
    pub fn record_emit(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self, throttled: bool) {
        if throttled {
            self.throttled_retries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transient_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an iterator refresh.
    pub fn record_iterator_refresh(&self) {
        self.iterators_refreshed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a drained split.
    pub fn record_split_finished(&self) {
        self.splits_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> ReaderMetricsSnapshot {
        ReaderMetricsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            empty_fetches: self.empty_fetches.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            throttled_retries: self.throttled_retries.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            iterators_refreshed: self.iterators_refreshed.load(Ordering::Relaxed),
            splits_finished: self.splits_finished.load(Ordering::Relaxed),
            millis_behind_latest: self.millis_behind_latest.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`ReaderMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ReaderMetricsSnapshot {
    pub fetches: u64,
    pub empty_fetches: u64,
    pub records_emitted: u64,
    pub throttled_retries: u64,
    pub transient_retries: u64,
    pub iterators_refreshed: u64,
    pub splits_finished: u64,
    pub millis_behind_latest: u64,
}

/// Enumerator counters.
#[derive(Debug, Default)]
pub struct EnumeratorMetrics {
    /// Completed discovery passes.
    pub discovery_runs: AtomicU64,
    /// Failed discovery attempts.
    pub discovery_failures: AtomicU64,
    /// Shards seen for the first time.
    pub shards_discovered: AtomicU64,
    /// Splits handed to readers.
    pub splits_assigned: AtomicU64,
}

impl EnumeratorMetrics {
    /// Records a completed discovery that found `new_shards` new shards.
    pub fn record_discovery(&self, new_shards: usize) {
        self.discovery_runs.fetch_add(1, Ordering::Relaxed);
        self.shards_discovered
            .fetch_add(new_shards as u64, Ordering::Relaxed);
    }

    /// Records a failed discovery attempt.
    pub fn record_discovery_failure(&self) {
        self.discovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `n` new assignments.
    pub fn record_assignments(&self, n: usize) {
        self.splits_assigned.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> EnumeratorMetricsSnapshot {
        EnumeratorMetricsSnapshot {
            discovery_runs: self.discovery_runs.load(Ordering::Relaxed),
            discovery_failures: self.discovery_failures.load(Ordering::Relaxed),
            shards_discovered: self.shards_discovered.load(Ordering::Relaxed),
            splits_assigned: self.splits_assigned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`EnumeratorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EnumeratorMetricsSnapshot {
    pub discovery_runs: u64,
    pub discovery_failures: u64,
    pub shards_discovered: u64,
    pub splits_assigned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_metrics() {
        let m = ReaderMetrics::default();
        m.record_fetch(3, Some(1500));
        m.record_fetch(0, None);
        m.record_emit();
        m.record_retry(true);
        m.record_retry(false);
        m.record_split_finished();
        let s = m.snapshot();
        assert_eq!(s.fetches, 2);
        assert_eq!(s.empty_fetches, 1);
        assert_eq!(s.records_emitted, 1);
        assert_eq!(s.throttled_retries, 1);
        assert_eq!(s.transient_retries, 1);
        assert_eq!(s.splits_finished, 1);
        assert_eq!(s.millis_behind_latest, 1500);
    }

    #[test]
    fn test_enumerator_metrics() {
        let m = EnumeratorMetrics::default();
        m.record_discovery(4);
        m.record_discovery(0);
        m.record_discovery_failure();
        m.record_assignments(2);
        let s = m.snapshot();
        assert_eq!(s.discovery_runs, 2);
        assert_eq!(s.shards_discovered, 4);
        assert_eq!(s.discovery_failures, 1);
        assert_eq!(s.splits_assigned, 2);
    }
}
