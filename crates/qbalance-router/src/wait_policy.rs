use crate::envelope::Envelope;
use crate::replica::Replica;
use async_trait::async_trait;
use qbalance_common::{Backend, BackendError, BalancerError, Executor, Output, Result, SubmitMode};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a replica worker does when its replica is unavailable or a backend
/// call fails transiently.
#[async_trait]
pub trait WaitPolicy<B: Backend>: Send + Sync {
    async fn run(
        &self,
        envelope: &Envelope,
        replica: &Replica<B>,
        executor: &dyn Executor<B>,
    ) -> Result<Output>;
}

enum Attempt {
    Done(Result<Output>),
    Transient(BackendError),
}

/// One backend call. A transient failure marks the replica down; any other
/// error is handed back to the caller unchanged.
async fn attempt<B: Backend>(
    envelope: &Envelope,
    replica: &Replica<B>,
    executor: &dyn Executor<B>,
) -> Attempt {
    match executor
        .execute(envelope.command().payload(), replica.backend())
        .await
    {
        Ok(output) => Attempt::Done(Ok(output)),
        Err(e) if replica.is_transient(&e) => {
            replica.mark_down(&e.to_string());
            Attempt::Transient(e)
        }
        Err(e) => Attempt::Done(Err(BalancerError::Backend {
            replica: replica.name().to_string(),
            source: e,
        })),
    }
}

/// `Wait` mode: park until the replica is restored, then try the same
/// command again. Retries are unbounded; a read is given up only once its
/// caller has stopped waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingRetry;

#[async_trait]
impl<B: Backend> WaitPolicy<B> for BlockingRetry {
    async fn run(
        &self,
        envelope: &Envelope,
        replica: &Replica<B>,
        executor: &dyn Executor<B>,
    ) -> Result<Output> {
        loop {
            if envelope.is_abandoned() {
                return Err(envelope.abandon_error());
            }

            if replica.is_running() {
                match attempt(envelope, replica, executor).await {
                    Attempt::Done(result) => return result,
                    Attempt::Transient(e) => warn!(
                        "Command {} failed on {}: {}, waiting for recovery",
                        envelope.id(),
                        replica.name(),
                        e
                    ),
                }
            }

            debug!(
                "Command {} parked until {} is available",
                envelope.id(),
                replica.name()
            );
            tokio::select! {
                _ = replica.wait_available() => {}
                _ = envelope.abandoned() => return Err(envelope.abandon_error()),
            }
            replica.clear_available();
        }
    }
}

/// `DontWait` mode: a down replica or a transient failure is reported to the
/// caller straight away.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

#[async_trait]
impl<B: Backend> WaitPolicy<B> for FailFast {
    async fn run(
        &self,
        envelope: &Envelope,
        replica: &Replica<B>,
        executor: &dyn Executor<B>,
    ) -> Result<Output> {
        if !replica.is_running() {
            return Err(BalancerError::ReplicaDown(replica.name().to_string()));
        }
        match attempt(envelope, replica, executor).await {
            Attempt::Done(result) => result,
            Attempt::Transient(e) => Err(BalancerError::Transient {
                replica: replica.name().to_string(),
                source: e,
            }),
        }
    }
}

/// The policy used for each submission mode.
pub struct WaitPolicies<B: Backend> {
    wait: Arc<dyn WaitPolicy<B>>,
    dont_wait: Arc<dyn WaitPolicy<B>>,
}

impl<B: Backend> WaitPolicies<B> {
    pub fn for_mode(&self, mode: SubmitMode) -> &dyn WaitPolicy<B> {
        match mode {
            SubmitMode::Wait => self.wait.as_ref(),
            SubmitMode::DontWait => self.dont_wait.as_ref(),
        }
    }

    pub fn set(&mut self, mode: SubmitMode, policy: Arc<dyn WaitPolicy<B>>) {
        match mode {
            SubmitMode::Wait => self.wait = policy,
            SubmitMode::DontWait => self.dont_wait = policy,
        }
    }
}

impl<B: Backend> Default for WaitPolicies<B> {
    fn default() -> Self {
        Self {
            wait: Arc::new(BlockingRetry),
            dont_wait: Arc::new(FailFast),
        }
    }
}
