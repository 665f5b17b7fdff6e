use crate::config::EligibilityBackoff;
use crate::envelope::Envelope;
use crate::replica::Replica;
use qbalance_common::{Backend, BalancerError, Result, TelemetryMetric};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, trace};

/// Picks the replica that serves a read command.
///
/// `try_route` makes a single pass: it either places the envelope on an
/// eligible replica's inbound queue and returns that replica, or hands the
/// envelope back untouched. Only running, idle replicas with an empty queue
/// are eligible, which keeps at most one routed command per replica.
pub trait RoutingAlgorithm<B: Backend>: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_route(
        &self,
        envelope: Envelope,
        replicas: &[Arc<Replica<B>>],
    ) -> std::result::Result<Arc<Replica<B>>, Envelope>;
}

/// Rotates through the replicas, skipping ineligible ones.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the rotation at `index` instead of the first replica.
    pub fn starting_at(index: usize) -> Self {
        Self {
            next: Mutex::new(index),
        }
    }

    pub fn position(&self) -> usize {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: Backend> RoutingAlgorithm<B> for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn try_route(
        &self,
        envelope: Envelope,
        replicas: &[Arc<Replica<B>>],
    ) -> std::result::Result<Arc<Replica<B>>, Envelope> {
        if replicas.is_empty() {
            return Err(envelope);
        }

        // Held across the scan and the enqueue so two readers cannot both
        // claim the same idle replica.
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..replicas.len() {
            let index = *next % replicas.len();
            *next = (index + 1) % replicas.len();
            let replica = &replicas[index];
            if replica.is_eligible() {
                replica.enqueue(envelope);
                return Ok(Arc::clone(replica));
            }
        }
        Err(envelope)
    }
}

/// Picks the eligible replica with the lowest telemetry reading.
///
/// Readings come from each replica's telemetry slot, refreshed in the
/// background by a `TelemetryRefresher`. Replicas without a reading rank
/// last. Ties go to the first candidate in rotation order, and the rotation
/// advances past the chosen replica so equal replicas take turns.
#[derive(Debug)]
pub struct Interval {
    metric: TelemetryMetric,
    next: Mutex<usize>,
}

impl Interval {
    pub fn new(metric: TelemetryMetric) -> Self {
        Self {
            metric,
            next: Mutex::new(0),
        }
    }

    pub fn lowest_latency() -> Self {
        Self::new(TelemetryMetric::Latency)
    }

    pub fn fewest_connections() -> Self {
        Self::new(TelemetryMetric::Connections)
    }

    pub fn metric(&self) -> TelemetryMetric {
        self.metric
    }
}

fn score(reading: Option<f64>) -> f64 {
    match reading {
        Some(value) if !value.is_nan() => value,
        _ => f64::INFINITY,
    }
}

impl<B: Backend> RoutingAlgorithm<B> for Interval {
    fn name(&self) -> &'static str {
        match self.metric {
            TelemetryMetric::Latency => "lowest_latency",
            TelemetryMetric::Connections => "fewest_connections",
        }
    }

    fn try_route(
        &self,
        envelope: Envelope,
        replicas: &[Arc<Replica<B>>],
    ) -> std::result::Result<Arc<Replica<B>>, Envelope> {
        if replicas.is_empty() {
            return Err(envelope);
        }

        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *next % replicas.len();
        let mut best: Option<(usize, f64)> = None;
        for offset in 0..replicas.len() {
            let index = (start + offset) % replicas.len();
            let replica = &replicas[index];
            if !replica.is_eligible() {
                continue;
            }
            let candidate = score(replica.telemetry());
            if best.map_or(true, |(_, lowest)| candidate < lowest) {
                best = Some((index, candidate));
            }
        }

        let Some((index, _)) = best else {
            return Err(envelope);
        };
        *next = (index + 1) % replicas.len();
        let replica = &replicas[index];
        replica.enqueue(envelope);
        Ok(Arc::clone(replica))
    }
}

/// Routes a read, rescanning with backoff while no replica is eligible.
///
/// Fails with `NoReplicas` for an empty replica set and with
/// `NoEligibleReplica` once the backoff's `max_wait` has passed.
pub async fn route_read<B: Backend>(
    algorithm: &dyn RoutingAlgorithm<B>,
    envelope: Envelope,
    replicas: &[Arc<Replica<B>>],
    backoff: &EligibilityBackoff,
) -> Result<Arc<Replica<B>>> {
    if replicas.is_empty() {
        return Err(BalancerError::NoReplicas);
    }

    let started = Instant::now();
    let mut delay = backoff.initial();
    let mut envelope = envelope;
    let mut scans = 0u32;
    loop {
        scans += 1;
        match algorithm.try_route(envelope, replicas) {
            Ok(replica) => {
                trace!(
                    "Command routed to {} by {} after {} scan(s)",
                    replica.name(),
                    algorithm.name(),
                    scans
                );
                return Ok(replica);
            }
            Err(returned) => envelope = returned,
        }

        let waited = started.elapsed();
        if waited >= backoff.max_wait() {
            debug!(
                "No eligible replica for command {} after {} scans",
                envelope.id(),
                scans
            );
            return Err(BalancerError::NoEligibleReplica {
                waited_ms: waited.as_millis() as u64,
            });
        }
        tokio::time::sleep(delay.min(backoff.max_wait() - waited)).await;
        delay = backoff.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Completion, Path};
    use crate::memory::MemoryBackend;
    use qbalance_common::Command;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn replicas(n: usize) -> Vec<Arc<Replica<MemoryBackend>>> {
        (1..=n)
            .map(|i| {
                Arc::new(Replica::with_default_classifier(
                    format!("r{}", i),
                    Arc::new(MemoryBackend::new()),
                ))
            })
            .collect()
    }

    fn envelope(id: u64) -> (Envelope, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let command = Arc::new(Command::read(json!({"get": "k"})));
        (Envelope::new(id, command, Path::Read, tx), rx)
    }

    /// Plays the worker's part: take the command and finish it.
    async fn drain(replica: &Replica<MemoryBackend>) {
        let _ = replica.next_command().await;
        replica.mark_idle();
    }

    fn route(
        algorithm: &dyn RoutingAlgorithm<MemoryBackend>,
        replicas: &[Arc<Replica<MemoryBackend>>],
        id: u64,
    ) -> Option<String> {
        let (envelope, _rx) = envelope(id);
        algorithm
            .try_route(envelope, replicas)
            .ok()
            .map(|r| r.name().to_string())
    }

    fn fast_backoff() -> EligibilityBackoff {
        EligibilityBackoff {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            max_wait_ms: 40,
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotates_over_idle_replicas() {
        let replicas = replicas(3);
        let rr = RoundRobin::new();
        let mut order = Vec::new();
        for id in 0..6 {
            let name = route(&rr, &replicas, id).unwrap();
            let replica = replicas.iter().find(|r| r.name() == name).unwrap();
            drain(replica).await;
            order.push(name);
        }
        assert_eq!(order, vec!["r1", "r2", "r3", "r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_round_robin_starts_from_current_position() {
        let replicas = replicas(3);
        let rr = RoundRobin::starting_at(2);
        assert_eq!(route(&rr, &replicas, 0).as_deref(), Some("r3"));
        assert_eq!(route(&rr, &replicas, 1).as_deref(), Some("r1"));
        assert_eq!(route(&rr, &replicas, 2).as_deref(), Some("r2"));
        assert_eq!(rr.position(), 2);
    }

    #[test]
    fn test_round_robin_single_flight() {
        let replicas = replicas(3);
        let rr = RoundRobin::new();
        assert_eq!(route(&rr, &replicas, 0).as_deref(), Some("r1"));
        assert_eq!(route(&rr, &replicas, 1).as_deref(), Some("r2"));
        assert_eq!(route(&rr, &replicas, 2).as_deref(), Some("r3"));
        // Every replica holds one command: nothing is eligible.
        assert_eq!(route(&rr, &replicas, 3), None);
        for replica in &replicas {
            assert_eq!(replica.queued(), 1);
        }
    }

    #[tokio::test]
    async fn test_round_robin_skips_busy_replica() {
        let replicas = replicas(3);
        let rr = RoundRobin::new();
        route(&rr, &replicas, 0);
        // r1 popped its command but has not finished it yet.
        let _in_flight = replicas[0].next_command().await;
        assert!(!replicas[0].is_idle());

        assert_eq!(route(&rr, &replicas, 1).as_deref(), Some("r2"));
        assert_eq!(route(&rr, &replicas, 2).as_deref(), Some("r3"));
        assert_eq!(route(&rr, &replicas, 3), None);
    }

    #[test]
    fn test_round_robin_skips_down_replica() {
        let replicas = replicas(3);
        replicas[1].mark_down("gone");
        let rr = RoundRobin::new();
        assert_eq!(route(&rr, &replicas, 0).as_deref(), Some("r1"));
        assert_eq!(route(&rr, &replicas, 1).as_deref(), Some("r3"));
        assert_eq!(route(&rr, &replicas, 2), None);
        assert_eq!(replicas[1].queued(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let replicas = replicas(4);
        let rr = RoundRobin::new();
        let mut counts = std::collections::HashMap::new();
        for id in 0..10 {
            let name = route(&rr, &replicas, id).unwrap();
            let replica = replicas.iter().find(|r| r.name() == name).unwrap();
            drain(replica).await;
            *counts.entry(name).or_insert(0) += 1;
        }
        for replica in &replicas {
            assert!(counts[replica.name()] >= 10 / 4);
        }
    }

    #[test]
    fn test_interval_prefers_lowest_reading() {
        let replicas = replicas(3);
        replicas[0].publish_telemetry(Some(30.0));
        replicas[1].publish_telemetry(Some(5.0));
        replicas[2].publish_telemetry(Some(12.0));
        let interval = Interval::lowest_latency();
        assert_eq!(route(&interval, &replicas, 0).as_deref(), Some("r2"));
        // r2 is busy now, so the next best wins.
        assert_eq!(route(&interval, &replicas, 1).as_deref(), Some("r3"));
        assert_eq!(route(&interval, &replicas, 2).as_deref(), Some("r1"));
        assert_eq!(route(&interval, &replicas, 3), None);
    }

    #[test]
    fn test_interval_missing_readings_rank_last() {
        let replicas = replicas(3);
        replicas[2].publish_telemetry(Some(100.0));
        replicas[0].publish_telemetry(Some(f64::NAN));
        let interval = Interval::fewest_connections();
        assert_eq!(route(&interval, &replicas, 0).as_deref(), Some("r3"));
    }

    #[tokio::test]
    async fn test_interval_ties_rotate() {
        let replicas = replicas(3);
        for replica in &replicas {
            replica.publish_telemetry(Some(1.0));
        }
        let interval = Interval::lowest_latency();
        let mut order = Vec::new();
        for id in 0..3 {
            let name = route(&interval, &replicas, id).unwrap();
            let replica = replicas.iter().find(|r| r.name() == name).unwrap();
            drain(replica).await;
            order.push(name);
        }
        assert_eq!(order, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn test_interval_skips_down_replica() {
        let replicas = replicas(2);
        replicas[0].publish_telemetry(Some(1.0));
        replicas[1].publish_telemetry(Some(9.0));
        replicas[0].mark_down("gone");
        let interval = Interval::lowest_latency();
        assert_eq!(route(&interval, &replicas, 0).as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_route_read_no_replicas() {
        let (envelope, _rx) = envelope(0);
        let result = route_read::<MemoryBackend>(&RoundRobin::new(), envelope, &[], &fast_backoff()).await;
        assert!(matches!(result, Err(BalancerError::NoReplicas)));
    }

    #[tokio::test]
    async fn test_route_read_gives_up_when_all_down() {
        let replicas = replicas(2);
        for replica in &replicas {
            replica.mark_down("gone");
        }
        let (envelope, _rx) = envelope(0);
        let started = Instant::now();
        let result = route_read(&RoundRobin::new(), envelope, &replicas, &fast_backoff()).await;
        assert!(matches!(result, Err(BalancerError::NoEligibleReplica { .. })));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_route_read_waits_for_replica_to_free_up() {
        let replicas = replicas(1);
        let rr = RoundRobin::new();
        route(&rr, &replicas, 0);

        let freer = {
            let replica = Arc::clone(&replicas[0]);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drain(&replica).await;
            })
        };

        let backoff = EligibilityBackoff {
            max_wait_ms: 2000,
            ..fast_backoff()
        };
        let (envelope, _rx) = envelope(1);
        let routed = route_read(&rr, envelope, &replicas, &backoff).await.unwrap();
        assert_eq!(routed.name(), "r1");
        freer.await.unwrap();
    }
}
