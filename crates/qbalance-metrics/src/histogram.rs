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

use std::sync::atomic::{AtomicU64, Ordering};

const NUM_BINS: usize = 100;

/// Logarithmic latency histogram.
///
/// Each power of ten is split into nine bins by leading digit, so bin `d * 10 + k`
/// covers `[k * 10^d, (k + 1) * 10^d)` microseconds. Bin 0 holds zero-length
/// samples. Anything at or above 10^10us lands in the last bin.
#[derive(Debug)]
pub(crate) struct LatencyHistogram {
    bins: [AtomicU64; NUM_BINS],
    total_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    pub(crate) fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        (decade * 10 + leading).min(NUM_BINS - 1)
    }

    /// Half-open `[lower, upper)` range covered by a bin.
    fn bounds(bin: usize) -> (u64, u64) {
        if bin == 0 {
            return (0, 1);
        }
        let scale = 10u64.pow((bin / 10) as u32);
        let leading = (bin % 10).max(1) as u64;
        (leading * scale, (leading + 1) * scale)
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= target {
                let (lower, upper) = Self::bounds(bin);
                let fraction = (target - cumulative) as f64 / count as f64;
                return lower + ((upper - lower) as f64 * fraction) as u64;
            }
            cumulative += count;
        }
        Self::bounds(NUM_BINS - 1).1
    }

    /// `(avg, p50, p95, p99)` in microseconds, all zero when empty.
    pub(crate) fn summary(&self) -> (u64, u64, u64, u64) {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_us.load(Ordering::Relaxed) / samples;
        (
            avg,
            self.percentile(50),
            self.percentile(95),
            self.percentile(99),
        )
    }
}
