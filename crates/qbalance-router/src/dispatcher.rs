use crate::config::{BalancerConfig, RoutePolicy};
use crate::envelope::{Completion, Envelope, Path};
use crate::fanout::WriteFanout;
use crate::health_monitor::HealthMonitor;
use crate::replica::Replica;
use crate::routing::{route_read, RoutingAlgorithm};
use qbalance_common::{
    Backend, BalancerError, Command, CommandId, CommandKind, Output, Payload, Result, SubmitMode,
};
use qbalance_metrics::{MetricsRegistry, MetricsSnapshot};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// The balancer's entry point.
///
/// Every submission gets the next command id and a private completion
/// channel. Reads go to a single replica chosen by the routing algorithm;
/// writes are fanned out to every replica. The caller is suspended until its
/// own result comes back.
///
/// # Read or write
///
/// With `RoutePolicy::ByKind` (the default), row-returning commands are
/// reads and non-row-returning commands are writes. `RoutePolicy::ByMode`
/// treats every `DontWait` command as a read and every `Wait` command as a
/// write instead.
///
/// # Background tasks
///
/// A dispatcher owns one worker task per replica, a health monitor and, for
/// interval routing, a telemetry refresher. They run until
/// [`Dispatcher::shutdown`] is called or the dispatcher is dropped.
///
/// Built with [`crate::BalancerBuilder`].
pub struct Dispatcher<B: Backend> {
    replicas: Vec<Arc<Replica<B>>>,
    routing: Arc<dyn RoutingAlgorithm<B>>,
    fanout: WriteFanout,
    next_id: AtomicU64,
    config: BalancerConfig,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthMonitor<B>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl<B: Backend> Dispatcher<B> {
    pub(crate) fn new(
        replicas: Vec<Arc<Replica<B>>>,
        routing: Arc<dyn RoutingAlgorithm<B>>,
        config: BalancerConfig,
        metrics: Arc<MetricsRegistry>,
        health: Arc<HealthMonitor<B>>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            replicas,
            routing,
            fanout: WriteFanout::new(config.fanout_ack),
            next_id: AtomicU64::new(0),
            config,
            metrics,
            health,
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Submits a command and waits for its result.
    ///
    /// # Arguments
    /// * `kind` - Selects the executor, and the path under `RoutePolicy::ByKind`
    /// * `mode` - `Wait` rides out replica outages, `DontWait` fails fast
    /// * `payload` - Handed to the executor untouched
    ///
    /// # Returns
    /// - `Ok(output)` - The executor's output
    /// - `Err(BalancerError::Transient { .. })` - `DontWait` command hit a failing replica
    /// - `Err(BalancerError::Backend { .. })` - Non-transient backend error
    /// - `Err(BalancerError::Timeout { .. })` - `submit_timeout_ms` elapsed
    pub async fn submit(
        &self,
        kind: CommandKind,
        mode: SubmitMode,
        payload: Payload,
    ) -> Result<Output> {
        self.submit_command(Command::new(kind, mode, payload)).await
    }

    /// Submits a prepared command, bounded by the configured submit timeout.
    pub async fn submit_command(&self, command: Command) -> Result<Output> {
        match self.config.submit_timeout() {
            Some(timeout) => self.submit_with_timeout(command, timeout).await,
            None => {
                let id = self.next_id();
                self.dispatch(id, command).await
            }
        }
    }

    /// Submits a command and gives up waiting after `timeout`.
    ///
    /// A read still parked on a down replica is dropped once the caller gives
    /// up. A write keeps going on every replica it was delivered to.
    pub async fn submit_with_timeout(&self, command: Command, timeout: Duration) -> Result<Output> {
        let id = self.next_id();
        match tokio::time::timeout(timeout, self.dispatch(id, command)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Command {} timed out after {}ms", id, timeout.as_millis());
                Err(BalancerError::Timeout {
                    id,
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Wraps to 0 past `u64::MAX`.
    fn next_id(&self) -> CommandId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn path_for(&self, command: &Command) -> Path {
        match self.config.route_by {
            RoutePolicy::ByKind => match command.kind() {
                CommandKind::RowReturning => Path::Read,
                CommandKind::NonRowReturning => Path::Write,
            },
            RoutePolicy::ByMode => match command.mode() {
                SubmitMode::DontWait => Path::Read,
                SubmitMode::Wait => Path::Write,
            },
        }
    }

    async fn dispatch(&self, id: CommandId, mut command: Command) -> Result<Output> {
        if self.is_shut_down() {
            return Err(BalancerError::ShutDown);
        }
        if !command.assign_id(id) {
            // Resubmission of a command that already went through once.
            command = Command::new(command.kind(), command.mode(), command.payload().clone());
            command.assign_id(id);
        }

        let command = Arc::new(command);
        let path = self.path_for(&command);
        self.metrics.record_submitted(path == Path::Write);
        trace!("Dispatching command {} on the {:?} path", id, path);

        let (tx, mut rx) = mpsc::unbounded_channel();
        match path {
            Path::Read => {
                let envelope = Envelope::new(id, command, Path::Read, tx);
                let replica = route_read(
                    self.routing.as_ref(),
                    envelope,
                    &self.replicas,
                    &self.config.eligibility,
                )
                .await?;
                self.metrics.record_routed(replica.name());
                Self::await_completion(&mut rx, id).await
            }
            Path::Write => {
                let expected = self
                    .fanout
                    .deliver(id, &command, &tx, &self.replicas, &self.metrics);
                drop(tx);
                self.fanout
                    .collect(&mut rx, expected, id, command.mode())
                    .await
            }
        }
    }

    async fn await_completion(
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        id: CommandId,
    ) -> Result<Output> {
        while let Some(completion) = rx.recv().await {
            if completion.id == id {
                return completion.result;
            }
            debug!(
                "Ignoring completion {} from {} while waiting for {}",
                completion.id, completion.replica, id
            );
        }
        Err(BalancerError::Abandoned(id))
    }

    pub fn replicas(&self) -> &[Arc<Replica<B>>] {
        &self.replicas
    }

    pub fn replica(&self, name: &str) -> Option<&Arc<Replica<B>>> {
        self.replicas.iter().find(|replica| replica.name() == name)
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Status report for every replica plus the routing setup and metrics.
    pub fn info(&self) -> serde_json::Value {
        let reports: Vec<_> = self.replicas.iter().map(|replica| replica.report()).collect();
        let running = self.replicas.iter().filter(|r| r.is_running()).count();
        json!({
            "routing": self.routing.name(),
            "route_by": self.config.route_by,
            "fanout_ack": self.fanout.ack(),
            "running": running,
            "down": self.replicas.len() - running,
            "replicas": reports,
            "metrics": self.metrics.snapshot(),
        })
    }

    /// Takes a replica out of rotation until the health monitor restores it.
    ///
    /// Returns `false` if there is no such replica or it was already down.
    pub fn mark_down(&self, name: &str) -> bool {
        match self.replica(name) {
            Some(replica) => replica.mark_down("marked down manually"),
            None => false,
        }
    }

    /// Runs one health pass right away. Returns how many replicas came back.
    pub async fn probe_now(&self) -> usize {
        self.health.check_down_replicas().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stops the balancer.
    ///
    /// Closes every replica, so queued commands are dropped and their
    /// callers see `Abandoned`, then aborts the worker, health and
    /// telemetry tasks. Later submissions fail with `ShutDown`. Calling it
    /// again does nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for replica in &self.replicas {
            replica.close();
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        info!("Balancer shut down ({} tasks stopped)", tasks.len());
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, id: CommandId) {
        self.next_id.store(id, Ordering::Relaxed);
    }
}

impl<B: Backend> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        for replica in &self.replicas {
            replica.close();
        }
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
