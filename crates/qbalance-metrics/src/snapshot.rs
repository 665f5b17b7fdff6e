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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters and latency summary for one replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetrics {
    /// Commands placed on the replica's inbound queue.
    pub routed: u64,
    pub succeeded: u64,
    /// Commands that ended in a non-transient error.
    pub failed: u64,
    /// Commands that ended in a transient error (the replica went down).
    pub transient_failures: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub reads: u64,
    pub writes: u64,
    pub uptime_ms: u64,
    pub replicas: BTreeMap<String, ReplicaMetrics>,
}

impl MetricsSnapshot {
    /// Total commands routed across all replicas. A fanned-out write counts
    /// once per replica.
    pub fn total_routed(&self) -> u64 {
        self.replicas.values().map(|r| r.routed).sum()
    }
}
