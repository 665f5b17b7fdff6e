use crate::replica::Replica;
use crate::wait_policy::WaitPolicies;
use qbalance_common::{Backend, BalancerError, CommandKind, Executor};
use qbalance_metrics::{MetricsRegistry, Outcome};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Executors by command kind.
pub struct ExecutorSet<B: Backend> {
    row_returning: Option<Arc<dyn Executor<B>>>,
    non_row_returning: Option<Arc<dyn Executor<B>>>,
}

impl<B: Backend> ExecutorSet<B> {
    pub fn new() -> Self {
        Self {
            row_returning: None,
            non_row_returning: None,
        }
    }

    pub fn get(&self, kind: CommandKind) -> Option<&dyn Executor<B>> {
        match kind {
            CommandKind::RowReturning => self.row_returning.as_deref(),
            CommandKind::NonRowReturning => self.non_row_returning.as_deref(),
        }
    }

    pub fn set(&mut self, kind: CommandKind, executor: Arc<dyn Executor<B>>) {
        match kind {
            CommandKind::RowReturning => self.row_returning = Some(executor),
            CommandKind::NonRowReturning => self.non_row_returning = Some(executor),
        }
    }

    pub fn contains(&self, kind: CommandKind) -> bool {
        self.get(kind).is_some()
    }
}

impl<B: Backend> Default for ExecutorSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// The replica's worker loop.
///
/// Takes one command at a time off the inbound queue, runs it through the
/// wait policy for its submission mode and posts the result to the caller.
/// The replica is marked idle before the result is posted, so a caller that
/// submits again right away can be routed back to it. Returns once the
/// replica has been closed.
pub async fn run_worker<B: Backend>(
    replica: Arc<Replica<B>>,
    executors: Arc<ExecutorSet<B>>,
    policies: Arc<WaitPolicies<B>>,
    metrics: Arc<MetricsRegistry>,
) {
    debug!("Worker for {} started", replica.name());

    while let Some(envelope) = replica.next_command().await {
        let command = envelope.command();
        trace!(
            "{} processing command {} ({}, {})",
            replica.name(),
            envelope.id(),
            command.kind(),
            command.mode()
        );

        let started = Instant::now();
        let result = match executors.get(command.kind()) {
            Some(executor) => {
                policies
                    .for_mode(command.mode())
                    .run(&envelope, &replica, executor)
                    .await
            }
            None => Err(BalancerError::MissingExecutor(command.kind())),
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_transient() => Outcome::Transient,
            Err(_) => Outcome::Failure,
        };
        metrics.record_completion(replica.name(), started.elapsed(), outcome);

        replica.mark_idle();
        envelope.complete(replica.name(), result);
    }

    debug!("Worker for {} stopped", replica.name());
}
