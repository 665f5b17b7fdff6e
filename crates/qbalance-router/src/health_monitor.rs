use crate::config::HealthConfig;
use crate::replica::Replica;
use qbalance_common::Backend;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Restores replicas that were marked down.
///
/// Every `interval`, each `DOWN` replica is pinged in parallel. A successful
/// ping flips it back to `RUNNING` and wakes any worker parked on its
/// recovery. A failed or timed-out ping is recorded and tried again next
/// round. Running replicas are never probed.
pub struct HealthMonitor<B: Backend> {
    replicas: Vec<Arc<Replica<B>>>,
    config: HealthConfig,
}

impl<B: Backend> HealthMonitor<B> {
    pub fn new(replicas: Vec<Arc<Replica<B>>>, config: HealthConfig) -> Self {
        Self { replicas, config }
    }

    /// Starts the monitor task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        // Every replica starts out running, so the first round waits a full period.
        let period = self.config.interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.check_down_replicas().await;
        }
    }

    /// One probe round. Returns how many replicas were restored.
    pub async fn check_down_replicas(&self) -> usize {
        let timeout = self.config.probe_timeout();
        let checks: Vec<_> = self
            .replicas
            .iter()
            .filter(|replica| !replica.is_running())
            .map(|replica| async move {
                let alive = Self::probe(replica, timeout).await;
                (replica, alive)
            })
            .collect();

        if checks.is_empty() {
            return 0;
        }

        let results = futures::future::join_all(checks).await;

        let mut restored = 0;
        for (replica, alive) in results {
            if alive {
                if replica.restore() {
                    restored += 1;
                }
            } else {
                let failures = replica.record_probe_failure("liveness probe failed");
                debug!(
                    "Replica {} still down after {} probe(s)",
                    replica.name(),
                    failures
                );
            }
        }

        if restored > 0 {
            info!("Health check restored {} replica(s)", restored);
        }
        restored
    }

    async fn probe(replica: &Replica<B>, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, replica.backend().ping()).await {
            Ok(alive) => alive,
            Err(_) => {
                debug!(
                    "Ping to {} timed out after {}ms",
                    replica.name(),
                    timeout.as_millis()
                );
                false
            }
        }
    }
}
