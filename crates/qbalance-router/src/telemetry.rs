use crate::config::TelemetryConfig;
use crate::replica::Replica;
use qbalance_common::{Backend, TelemetryMetric};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Periodically measures every running replica for interval routing.
///
/// Each reading replaces the replica's previous one. A failed or timed-out
/// measurement clears the slot, which ranks the replica last until the next
/// good reading.
pub struct TelemetryRefresher<B: Backend> {
    replicas: Vec<Arc<Replica<B>>>,
    metric: TelemetryMetric,
    config: TelemetryConfig,
}

impl<B: Backend> TelemetryRefresher<B> {
    pub fn new(
        replicas: Vec<Arc<Replica<B>>>,
        metric: TelemetryMetric,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            replicas,
            metric,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.refresh_once().await;
            }
        })
    }

    /// Measures all running replicas once. Returns how many produced a reading.
    pub async fn refresh_once(&self) -> usize {
        let timeout = self.config.probe_timeout();
        let metric = self.metric;
        let measurements = self
            .replicas
            .iter()
            .filter(|replica| replica.is_running())
            .map(|replica| async move {
                let reading =
                    match tokio::time::timeout(timeout, replica.backend().measure(metric)).await {
                        Ok(Ok(value)) => Some(value),
                        Ok(Err(e)) => {
                            debug!("Measuring {} on {} failed: {}", metric, replica.name(), e);
                            None
                        }
                        Err(_) => {
                            debug!("Measuring {} on {} timed out", metric, replica.name());
                            None
                        }
                    };
                replica.publish_telemetry(reading);
                reading.is_some()
            });

        let measured = futures::future::join_all(measurements)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        trace!("Telemetry refreshed for {} replica(s)", measured);
        measured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::time::Duration;

    fn replica(name: &str, backend: MemoryBackend) -> Arc<Replica<MemoryBackend>> {
        Arc::new(Replica::with_default_classifier(name, Arc::new(backend)))
    }

    #[tokio::test]
    async fn test_refresh_publishes_latency() {
        let replicas = vec![
            replica("r1", MemoryBackend::new().with_latency(Duration::from_millis(7))),
            replica("r2", MemoryBackend::new()),
        ];
        let refresher = TelemetryRefresher::new(
            replicas.clone(),
            TelemetryMetric::Latency,
            TelemetryConfig::default(),
        );

        assert_eq!(refresher.refresh_once().await, 2);
        assert_eq!(replicas[0].telemetry(), Some(7.0));
        assert_eq!(replicas[1].telemetry(), Some(0.0));
    }

    #[tokio::test]
    async fn test_refresh_clears_failed_reading() {
        let backend = Arc::new(MemoryBackend::new());
        let replicas = vec![Arc::new(Replica::with_default_classifier(
            "r1",
            Arc::clone(&backend),
        ))];
        let refresher = TelemetryRefresher::new(
            replicas.clone(),
            TelemetryMetric::Connections,
            TelemetryConfig::default(),
        );
        refresher.refresh_once().await;
        assert_eq!(replicas[0].telemetry(), Some(0.0));

        backend.set_online(false);
        assert_eq!(refresher.refresh_once().await, 0);
        assert_eq!(replicas[0].telemetry(), None);
    }

    #[tokio::test]
    async fn test_refresh_skips_down_replicas() {
        let replicas = vec![replica("r1", MemoryBackend::new())];
        replicas[0].mark_down("gone");
        let refresher = TelemetryRefresher::new(
            replicas.clone(),
            TelemetryMetric::Latency,
            TelemetryConfig::default(),
        );
        assert_eq!(refresher.refresh_once().await, 0);
        assert_eq!(replicas[0].telemetry(), None);
    }
}
