use crate::envelope::Envelope;
use crate::signal::Signal;
use qbalance_common::{Backend, BackendError, TransientClassifier};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{info, trace};

/// Availability of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Running,
    Down,
}

#[derive(Debug)]
struct ReplicaState {
    status: ReplicaStatus,
    down_since: Option<Instant>,
    last_error: Option<String>,
    last_probe: Option<Instant>,
    consecutive_probe_failures: u32,
    times_down: u64,
}

/// Point-in-time view of a replica, for `Dispatcher::info`.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaReport {
    pub name: String,
    pub status: ReplicaStatus,
    pub idle: bool,
    pub queued: usize,
    pub down_for_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_probe_ms_ago: Option<u64>,
    pub consecutive_probe_failures: u32,
    pub times_down: u64,
    pub telemetry: Option<f64>,
}

/// One database backend plus the runtime state the balancer keeps for it.
///
/// The inbound queue and its admission semaphore are the only way work
/// reaches the replica's worker: every push adds exactly one permit, and the
/// worker takes one permit per pop. The idle signal is cleared while the
/// worker holds a command and set again once it is done.
pub struct Replica<B: Backend> {
    name: String,
    backend: Arc<B>,
    classifier: Arc<dyn TransientClassifier>,
    state: Mutex<ReplicaState>,
    inbound: Mutex<VecDeque<Envelope>>,
    admission: Semaphore,
    idle: Signal,
    available: Signal,
    telemetry: watch::Sender<Option<f64>>,
}

impl<B: Backend> Replica<B> {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<B>,
        classifier: Arc<dyn TransientClassifier>,
    ) -> Self {
        let (telemetry, _) = watch::channel(None);
        Self {
            name: name.into(),
            backend,
            classifier,
            state: Mutex::new(ReplicaState {
                status: ReplicaStatus::Running,
                down_since: None,
                last_error: None,
                last_probe: None,
                consecutive_probe_failures: 0,
                times_down: 0,
            }),
            inbound: Mutex::new(VecDeque::new()),
            admission: Semaphore::new(0),
            idle: Signal::new(true),
            available: Signal::new(true),
            telemetry,
        }
    }

    /// Replica using the default classifier of its backend's family.
    pub fn with_default_classifier(name: impl Into<String>, backend: Arc<B>) -> Self {
        let classifier = Arc::new(backend.family().default_classifier());
        Self::new(name, backend, classifier)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn status(&self) -> ReplicaStatus {
        self.state().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == ReplicaStatus::Running
    }

    pub fn is_idle(&self) -> bool {
        self.idle.is_set()
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Running, nothing queued and no command in flight.
    ///
    /// The queue is read before the idle flag. `next_command` clears idle
    /// before it pops, so a command moving from the queue to the worker
    /// always fails one of the two checks.
    pub fn is_eligible(&self) -> bool {
        self.is_running() && self.queue().is_empty() && self.is_idle()
    }

    pub fn is_transient(&self, error: &BackendError) -> bool {
        self.classifier.is_transient(error)
    }

    /// Appends a command and releases one admission permit for it.
    ///
    /// A closed replica drops the command instead, which its caller observes
    /// as abandonment.
    pub fn enqueue(&self, envelope: Envelope) {
        let mut queue = self.queue();
        if self.admission.is_closed() {
            trace!("Replica {} closed, dropping command {}", self.name, envelope.id());
            return;
        }
        queue.push_back(envelope);
        self.admission.add_permits(1);
    }

    /// Waits for the next command, declares the replica busy and pops it.
    /// Returns `None` once the replica has been closed.
    pub async fn next_command(&self) -> Option<Envelope> {
        let permit = self.admission.acquire().await.ok()?;
        permit.forget();
        self.idle.clear();
        self.queue().pop_front()
    }

    pub fn mark_idle(&self) {
        self.idle.set();
    }

    /// Stops the worker at its next wait. Queued commands are dropped, which
    /// their callers observe as abandonment.
    pub fn close(&self) {
        let mut queue = self.queue();
        self.admission.close();
        queue.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.admission.is_closed()
    }

    /// `Running -> Down`. Returns `false` if the replica was already down.
    pub fn mark_down(&self, reason: &str) -> bool {
        let mut state = self.state();
        state.last_error = Some(reason.to_string());
        if state.status == ReplicaStatus::Down {
            return false;
        }
        state.status = ReplicaStatus::Down;
        state.down_since = Some(Instant::now());
        state.times_down += 1;
        self.available.clear();
        info!("Replica {} marked down: {}", self.name, reason);
        true
    }

    /// `Down -> Running`, waking a worker blocked on recovery. A no-op that
    /// returns `false` when the replica is already running.
    pub fn restore(&self) -> bool {
        let mut state = self.state();
        state.last_probe = Some(Instant::now());
        if state.status == ReplicaStatus::Running {
            return false;
        }
        let down_for = state.down_since.take().map(|t| t.elapsed());
        state.status = ReplicaStatus::Running;
        state.consecutive_probe_failures = 0;
        self.available.set();
        info!(
            "Replica {} restored after {}ms down",
            self.name,
            down_for.map(|d| d.as_millis()).unwrap_or(0)
        );
        true
    }

    /// Records a failed liveness probe and returns the consecutive failure count.
    pub fn record_probe_failure(&self, reason: &str) -> u32 {
        let mut state = self.state();
        state.last_probe = Some(Instant::now());
        state.last_error = Some(reason.to_string());
        state.consecutive_probe_failures += 1;
        state.consecutive_probe_failures
    }

    pub fn is_available(&self) -> bool {
        self.available.is_set()
    }

    pub async fn wait_available(&self) {
        self.available.wait().await
    }

    pub fn clear_available(&self) {
        self.available.clear()
    }

    /// Latest telemetry reading, if one has been taken.
    pub fn telemetry(&self) -> Option<f64> {
        *self.telemetry.borrow()
    }

    /// Replaces the telemetry reading. The slot holds one value; older
    /// readings are overwritten.
    pub fn publish_telemetry(&self, value: Option<f64>) {
        self.telemetry.send_replace(value);
    }

    pub fn report(&self) -> ReplicaReport {
        let state = self.state();
        ReplicaReport {
            name: self.name.clone(),
            status: state.status,
            idle: self.is_idle(),
            queued: self.queued(),
            down_for_ms: state.down_since.map(|t| t.elapsed().as_millis() as u64),
            last_error: state.last_error.clone(),
            last_probe_ms_ago: state.last_probe.map(|t| t.elapsed().as_millis() as u64),
            consecutive_probe_failures: state.consecutive_probe_failures,
            times_down: state.times_down,
            telemetry: self.telemetry(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: Backend> std::fmt::Debug for Replica<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("idle", &self.is_idle())
            .field("queued", &self.queued())
            .finish()
    }
}
