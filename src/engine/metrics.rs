//! STRATA - Engine Metrics
//! Lock-free counters for writes, reads, freezes and merges, read back
//! through a point-in-time [`MetricsSnapshot`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::MergeResult;

/// One engine counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Upserts,
    Deletes,
    Gets,
    /// Iterators created.
    Iterators,
    /// Mutable segments moved into the read-only queue.
    Freezes,
    MergesSucceeded,
    MergesCancelled,
    MergesFailed,
    /// Merge requests that found nothing to do, had to be retried or lost
    /// the race against a running merge.
    MergesSkipped,
    /// Entries appended one by one to new disk segments.
    MergedRecords,
    /// Tombstones and superseded copies left behind by merges.
    DroppedRecords,
    /// Disk segment parts spliced into new segments without rewriting.
    ReusedParts,
    /// Segments rebuilt from their WAL on open.
    RecoveredSegments,
}

const COUNTERS: usize = 13;

impl Counter {
    pub const ALL: [Counter; COUNTERS] = [
        Counter::Upserts,
        Counter::Deletes,
        Counter::Gets,
        Counter::Iterators,
        Counter::Freezes,
        Counter::MergesSucceeded,
        Counter::MergesCancelled,
        Counter::MergesFailed,
        Counter::MergesSkipped,
        Counter::MergedRecords,
        Counter::DroppedRecords,
        Counter::ReusedParts,
        Counter::RecoveredSegments,
    ];

    fn label(self) -> &'static str {
        match self {
            Counter::Upserts => "upserts",
            Counter::Deletes => "deletes",
            Counter::Gets => "gets",
            Counter::Iterators => "iterators",
            Counter::Freezes => "freezes",
            Counter::MergesSucceeded => "succeeded",
            Counter::MergesCancelled => "cancelled",
            Counter::MergesFailed => "failed",
            Counter::MergesSkipped => "skipped",
            Counter::MergedRecords => "written",
            Counter::DroppedRecords => "dropped",
            Counter::ReusedParts => "reused parts",
            Counter::RecoveredSegments => "recovered",
        }
    }
}

/// Counters of one engine instance. `Relaxed` throughout: the values are
/// observed, never used to synchronize.
#[derive(Debug)]
pub struct EngineMetrics {
    counters: [AtomicU64; COUNTERS],
    started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn add(&self, counter: Counter, amount: u64) {
        self.counters[counter as usize].fetch_add(amount, Ordering::Relaxed);
    }

    pub(crate) fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub(crate) fn record_merge(&self, result: MergeResult) {
        self.increment(match result {
            MergeResult::Success => Counter::MergesSucceeded,
            MergeResult::CancelledByUser => Counter::MergesCancelled,
            MergeResult::Failure => Counter::MergesFailed,
            MergeResult::NothingToMerge
            | MergeResult::RetryReadOnlySegmentsNotReady
            | MergeResult::AnotherMergeRunning => Counter::MergesSkipped,
        });
    }

    pub(crate) fn record_merge_output(&self, written: u64, dropped: u64, reused_parts: u64) {
        self.add(Counter::MergedRecords, written);
        self.add(Counter::DroppedRecords, dropped);
        self.add(Counter::ReusedParts, reused_parts);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            values: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at one instant. `Display` renders the human report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    values: [u64; COUNTERS],
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize]
    }

    /// Client-facing operations: writes, point reads and iterators.
    pub fn operations(&self) -> u64 {
        [
            Counter::Upserts,
            Counter::Deletes,
            Counter::Gets,
            Counter::Iterators,
        ]
        .into_iter()
        .map(|c| self.get(c))
        .sum()
    }

    pub fn operations_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs < 0.001 {
            0.0
        } else {
            self.operations() as f64 / secs
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sections: [(&str, &[Counter]); 3] = [
            (
                "Operations",
                &[
                    Counter::Upserts,
                    Counter::Deletes,
                    Counter::Gets,
                    Counter::Iterators,
                ],
            ),
            ("Segments", &[Counter::Freezes, Counter::RecoveredSegments]),
            (
                "Merges",
                &[
                    Counter::MergesSucceeded,
                    Counter::MergesCancelled,
                    Counter::MergesFailed,
                    Counter::MergesSkipped,
                    Counter::MergedRecords,
                    Counter::DroppedRecords,
                    Counter::ReusedParts,
                ],
            ),
        ];
        writeln!(f, "═══ STRATA Engine Metrics ═══")?;
        for (title, counters) in sections {
            writeln!(f, "{}:", title)?;
            for &counter in counters {
                writeln!(f, "  {:<13}{}", format!("{}:", counter.label()), self.get(counter))?;
            }
        }
        writeln!(
            f,
            "Throughput: {} ops, {:.2} ops/sec",
            self.operations(),
            self.operations_per_sec()
        )?;
        write!(f, "Uptime: {:.2}s", self.elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent() {
        let metrics = EngineMetrics::new();
        metrics.increment(Counter::Upserts);
        metrics.increment(Counter::Upserts);
        metrics.increment(Counter::Gets);
        metrics.add(Counter::Freezes, 3);

        assert_eq!(metrics.get(Counter::Upserts), 2);
        assert_eq!(metrics.get(Counter::Gets), 1);
        assert_eq!(metrics.get(Counter::Freezes), 3);
        assert_eq!(metrics.get(Counter::Deletes), 0);
        assert_eq!(metrics.snapshot().operations(), 3);
    }

    #[test]
    fn test_merge_results_map_to_counters() {
        let metrics = EngineMetrics::default();
        for result in [
            MergeResult::Success,
            MergeResult::AnotherMergeRunning,
            MergeResult::NothingToMerge,
            MergeResult::Failure,
        ] {
            metrics.record_merge(result);
        }
        metrics.record_merge_output(100, 7, 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get(Counter::MergesSucceeded), 1);
        assert_eq!(snapshot.get(Counter::MergesSkipped), 2);
        assert_eq!(snapshot.get(Counter::MergesFailed), 1);
        assert_eq!(snapshot.get(Counter::MergedRecords), 100);
        assert_eq!(snapshot.get(Counter::DroppedRecords), 7);
        assert_eq!(snapshot.get(Counter::ReusedParts), 2);
    }

    #[test]
    fn test_report_lists_every_counter() {
        let metrics = EngineMetrics::new();
        metrics.increment(Counter::Deletes);
        let report = metrics.snapshot().to_string();
        for counter in Counter::ALL {
            assert!(report.contains(counter.label()), "{:?} missing", counter);
        }
        assert!(report.contains("ops/sec"));
    }
}
