use crate::config::BalancerConfig;
use crate::dispatcher::Dispatcher;
use crate::health_monitor::HealthMonitor;
use crate::replica::Replica;
use crate::routing::{Interval, RoundRobin, RoutingAlgorithm};
use crate::telemetry::TelemetryRefresher;
use crate::wait_policy::{WaitPolicies, WaitPolicy};
use crate::worker::{run_worker, ExecutorSet};
use qbalance_common::{
    Backend, BalancerError, CommandKind, Executor, Result, SubmitMode, TransientClassifier,
};
use qbalance_metrics::MetricsRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Assembles a [`Dispatcher`] and starts its background tasks.
///
/// # Example
/// ```
/// # use qbalance_router::{BalancerBuilder, BalancerConfig};
/// # use qbalance_router::memory::{MemoryBackend, MemoryQuery, MemoryStatement};
/// # use qbalance_common::{CommandKind, SubmitMode};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use serde_json::json;
///
/// let dispatcher = BalancerBuilder::new(BalancerConfig::default())
///     .replica("primary", MemoryBackend::new())
///     .replica("replica-1", MemoryBackend::new())
///     .executor(CommandKind::RowReturning, MemoryQuery)
///     .executor(CommandKind::NonRowReturning, MemoryStatement)
///     .build()?;
///
/// dispatcher
///     .submit(CommandKind::NonRowReturning, SubmitMode::Wait, json!({"set": "a", "value": 1}))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct BalancerBuilder<B: Backend> {
    config: BalancerConfig,
    replicas: Vec<Replica<B>>,
    executors: ExecutorSet<B>,
    policies: WaitPolicies<B>,
}

impl<B: Backend> BalancerBuilder<B> {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            replicas: Vec::new(),
            executors: ExecutorSet::new(),
            policies: WaitPolicies::default(),
        }
    }

    /// Adds a replica using its backend family's transient classifier.
    pub fn replica(mut self, name: impl Into<String>, backend: B) -> Self {
        self.replicas
            .push(Replica::with_default_classifier(name, Arc::new(backend)));
        self
    }

    pub fn replica_with_classifier(
        mut self,
        name: impl Into<String>,
        backend: B,
        classifier: impl TransientClassifier + 'static,
    ) -> Self {
        self.replicas
            .push(Replica::new(name, Arc::new(backend), Arc::new(classifier)));
        self
    }

    /// Adds a replica that shares its backend handle with the caller.
    pub fn shared_replica(mut self, name: impl Into<String>, backend: Arc<B>) -> Self {
        self.replicas
            .push(Replica::with_default_classifier(name, backend));
        self
    }

    pub fn executor(mut self, kind: CommandKind, executor: impl Executor<B> + 'static) -> Self {
        self.executors.set(kind, Arc::new(executor));
        self
    }

    /// Replaces the wait policy used for `mode`.
    pub fn wait_policy(mut self, mode: SubmitMode, policy: Arc<dyn WaitPolicy<B>>) -> Self {
        self.policies.set(mode, policy);
        self
    }

    /// Validates the setup and starts the balancer.
    ///
    /// Must be called from within a Tokio runtime: one worker task per
    /// replica, the health monitor and, for interval routing, the telemetry
    /// refresher are spawned here.
    ///
    /// # Errors
    /// - `InvalidConfig` - bad config, duplicate replica names or no runtime
    /// - `NoReplicas` - no replica was added
    pub fn build(self) -> Result<Dispatcher<B>> {
        self.config.validate()?;
        if self.replicas.is_empty() {
            return Err(BalancerError::NoReplicas);
        }
        let mut names = HashSet::new();
        for replica in &self.replicas {
            if !names.insert(replica.name().to_string()) {
                return Err(BalancerError::InvalidConfig(format!(
                    "duplicate replica name: {}",
                    replica.name()
                )));
            }
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BalancerError::InvalidConfig(
                "a Tokio runtime is required to start the balancer".to_string(),
            ));
        }
        for kind in [CommandKind::RowReturning, CommandKind::NonRowReturning] {
            if !self.executors.contains(kind) {
                warn!("No executor registered for {} commands", kind);
            }
        }

        let replicas: Vec<Arc<Replica<B>>> = self.replicas.into_iter().map(Arc::new).collect();
        let metrics = Arc::new(MetricsRegistry::with_replicas(
            replicas.iter().map(|r| r.name().to_string()),
        ));
        let executors = Arc::new(self.executors);
        let policies = Arc::new(self.policies);

        let mut tasks = Vec::with_capacity(replicas.len() + 2);
        for replica in &replicas {
            tasks.push(tokio::spawn(run_worker(
                Arc::clone(replica),
                Arc::clone(&executors),
                Arc::clone(&policies),
                Arc::clone(&metrics),
            )));
        }

        let health = Arc::new(HealthMonitor::new(replicas.clone(), self.config.health.clone()));
        tasks.push(Arc::clone(&health).spawn());

        let routing: Arc<dyn RoutingAlgorithm<B>> = match self.config.routing.telemetry_metric() {
            None => Arc::new(RoundRobin::new()),
            Some(metric) => {
                let refresher = Arc::new(TelemetryRefresher::new(
                    replicas.clone(),
                    metric,
                    self.config.telemetry.clone(),
                ));
                tasks.push(refresher.spawn());
                Arc::new(Interval::new(metric))
            }
        };

        info!(
            "Balancer started with {} replicas, {} routing",
            replicas.len(),
            routing.name()
        );

        Ok(Dispatcher::new(
            replicas,
            routing,
            self.config,
            metrics,
            health,
            tasks,
        ))
    }
}
