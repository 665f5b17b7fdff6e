// Copyright 2025 qbalance Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::histogram::LatencyHistogram;
use crate::snapshot::{MetricsSnapshot, ReplicaMetrics};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// How a command ended on a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transient backend failure; the replica was marked down.
    Transient,
    Failure,
}

#[derive(Debug)]
struct ReplicaStats {
    routed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    transient_failures: AtomicU64,
    latencies: LatencyHistogram,
}

impl ReplicaStats {
    fn new() -> Self {
        Self {
            routed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> ReplicaMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.summary();
        ReplicaMetrics {
            routed: self.routed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Thread-safe metrics storage.
///
/// Counters are relaxed atomics; the replica map is behind an `RwLock` that is
/// only taken for writing the first time a replica name is seen. Snapshots are
/// best-effort and may be slightly inconsistent across counters.
#[derive(Debug)]
pub struct MetricsRegistry {
    submitted: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    replicas: RwLock<HashMap<String, Arc<ReplicaStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            replicas: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Pre-registers replicas so they show up in snapshots before their first command.
    pub fn with_replicas<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        {
            let mut replicas = registry
                .replicas
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for name in names {
                replicas.insert(name.into(), Arc::new(ReplicaStats::new()));
            }
        }
        registry
    }

    pub fn record_submitted(&self, is_write: bool) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_routed(&self, replica: &str) {
        self.stats(replica).routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, replica: &str, latency: Duration, outcome: Outcome) {
        let stats = self.stats(replica);
        stats
            .latencies
            .record(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
        let counter = match outcome {
            Outcome::Success => &stats.succeeded,
            Outcome::Transient => &stats.transient_failures,
            Outcome::Failure => &stats.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let replicas: BTreeMap<String, ReplicaMetrics> = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            uptime_ms: u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            replicas,
        }
    }

    fn stats(&self, replica: &str) -> Arc<ReplicaStats> {
        if let Some(stats) = self
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(replica)
        {
            return Arc::clone(stats);
        }

        let mut replicas = self
            .replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            replicas
                .entry(replica.to_string())
                .or_insert_with(|| Arc::new(ReplicaStats::new())),
        )
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_with_replicas_registers_names() {
        let registry = MetricsRegistry::with_replicas(["r1", "r2"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.replicas.len(), 2);
        assert_eq!(snapshot.replicas["r1"], ReplicaMetrics::default());
    }

    #[test]
    fn test_submitted_split() {
        let registry = MetricsRegistry::new();
        registry.record_submitted(false);
        registry.record_submitted(false);
        registry.record_submitted(true);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.reads, 2);
        assert_eq!(snapshot.writes, 1);
    }

    #[test]
    fn test_outcomes_are_counted_per_replica() {
        let registry = MetricsRegistry::new();
        registry.record_routed("r1");
        registry.record_routed("r1");
        registry.record_routed("r2");
        registry.record_completion("r1", Duration::from_micros(100), Outcome::Success);
        registry.record_completion("r1", Duration::from_micros(300), Outcome::Failure);
        registry.record_completion("r2", Duration::from_millis(2), Outcome::Transient);

        let snapshot = registry.snapshot();
        let r1 = &snapshot.replicas["r1"];
        assert_eq!(r1.routed, 2);
        assert_eq!(r1.succeeded, 1);
        assert_eq!(r1.failed, 1);
        assert_eq!(r1.avg_latency_us, 200);

        let r2 = &snapshot.replicas["r2"];
        assert_eq!(r2.transient_failures, 1);
        assert_eq!(r2.succeeded, 0);
        assert_eq!(snapshot.total_routed(), 3);
    }

    #[test]
    fn test_concurrent_recording() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let name = format!("r{}", i % 2);
                    for _ in 0..1000 {
                        registry.record_routed(&name);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.replicas["r0"].routed, 4000);
        assert_eq!(snapshot.replicas["r1"].routed, 4000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::with_replicas(["r1"]);
        let value = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(value["replicas"]["r1"]["routed"], 0);
        assert!(value["uptime_ms"].is_u64());
    }
}
