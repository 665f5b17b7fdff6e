use crate::config::FanoutAck;
use crate::envelope::{Completion, Envelope, Path};
use crate::replica::Replica;
use qbalance_common::{Backend, BalancerError, Command, CommandId, Output, Result, SubmitMode};
use qbalance_metrics::MetricsRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Delivers write commands to every replica.
///
/// Each replica gets its own envelope on its inbound queue and processes it
/// under its own wait policy, so one slow or failed replica does not hold up
/// delivery to the rest. `ack` decides when the caller gets an answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFanout {
    ack: FanoutAck,
}

impl WriteFanout {
    pub fn new(ack: FanoutAck) -> Self {
        Self { ack }
    }

    pub fn ack(&self) -> FanoutAck {
        self.ack
    }

    /// Enqueues one copy of `command` per replica, ignoring eligibility.
    /// Returns the number of copies delivered.
    pub fn deliver<B: Backend>(
        &self,
        id: CommandId,
        command: &Arc<Command>,
        reply: &mpsc::UnboundedSender<Completion>,
        replicas: &[Arc<Replica<B>>],
        metrics: &MetricsRegistry,
    ) -> usize {
        for replica in replicas {
            let envelope = Envelope::new(id, Arc::clone(command), Path::Write, reply.clone());
            replica.enqueue(envelope);
            metrics.record_routed(replica.name());
        }
        trace!("Write {} delivered to {} replicas", id, replicas.len());
        replicas.len()
    }

    /// Waits for enough completions of write `id` to answer the caller.
    ///
    /// With `Any`, the first success wins; if every replica fails, the first
    /// failure is returned. With `All`, every replica must report and the
    /// first failure, if any, is returned.
    ///
    /// `DontWait` writes always wait for every replica, since a replica that
    /// failed fast never applies the write. A transient failure takes
    /// precedence over other failures.
    pub async fn collect(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        expected: usize,
        id: CommandId,
        mode: SubmitMode,
    ) -> Result<Output> {
        if expected == 0 {
            return Err(BalancerError::NoReplicas);
        }

        let first_success_wins = self.ack == FanoutAck::Any && mode == SubmitMode::Wait;
        let mut received = 0;
        let mut first_output: Option<Output> = None;
        let mut first_error: Option<BalancerError> = None;

        while received < expected {
            let Some(completion) = rx.recv().await else {
                return Err(BalancerError::Abandoned(id));
            };
            if completion.id != id {
                debug!(
                    "Ignoring completion {} from {} while waiting for {}",
                    completion.id, completion.replica, id
                );
                continue;
            }
            received += 1;

            match completion.result {
                Ok(output) => {
                    if first_success_wins {
                        trace!("Write {} acknowledged by {}", id, completion.replica);
                        return Ok(output);
                    }
                    first_output.get_or_insert(output);
                }
                Err(e) => {
                    debug!("Write {} failed on {}: {}", id, completion.replica, e);
                    let replace = first_error
                        .as_ref()
                        .map_or(true, |kept| !kept.is_transient() && e.is_transient());
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        match (first_error, first_output) {
            (Some(e), _) => Err(e),
            (None, Some(output)) => Ok(output),
            (None, None) => Err(BalancerError::Abandoned(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use qbalance_common::BackendError;
    use serde_json::json;

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

    fn completion(id: CommandId, replica: &str, result: Result<Output>) -> Completion {
        Completion {
            id,
            replica: replica.to_string(),
            result,
        }
    }

    fn failed(replica: &str) -> Result<Output> {
        Err(BalancerError::Backend {
            replica: replica.to_string(),
            source: BackendError::Integrity("duplicate key".into()),
        })
    }

    #[test]
    fn test_deliver_reaches_every_replica() {
        let replicas = replicas(3);
        // Busy and down replicas still receive writes.
        replicas[1].mark_down("gone");
        let metrics = MetricsRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = Arc::new(Command::write(json!({"set": "k", "value": 1})));

        let delivered = WriteFanout::default().deliver(7, &command, &tx, &replicas, &metrics);
        assert_eq!(delivered, 3);
        for replica in &replicas {
            assert_eq!(replica.queued(), 1);
        }
        assert_eq!(metrics.snapshot().total_routed(), 3);
    }

    #[tokio::test]
    async fn test_collect_any_returns_first_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(completion(1, "r1", failed("r1"))).unwrap();
        tx.send(completion(1, "r2", Ok(json!({"affected": 1})))).unwrap();

        let fanout = WriteFanout::new(FanoutAck::Any);
        let output = fanout.collect(&mut rx, 3, 1, SubmitMode::Wait).await.unwrap();
        assert_eq!(output, json!({"affected": 1}));
    }

    #[tokio::test]
    async fn test_collect_any_all_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(completion(1, "r1", failed("r1"))).unwrap();
        tx.send(completion(1, "r2", failed("r2"))).unwrap();

        let fanout = WriteFanout::new(FanoutAck::Any);
        let err = fanout.collect(&mut rx, 2, 1, SubmitMode::Wait).await.unwrap_err();
        assert_eq!(err.replica(), Some("r1"));
    }

    #[tokio::test]
    async fn test_collect_any_dont_wait_reports_transient_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(completion(5, "r2", Ok(json!({"affected": 1})))).unwrap();
        tx.send(completion(5, "r3", failed("r3"))).unwrap();
        let down = Err(BalancerError::ReplicaDown("r1".into()));
        tx.send(completion(5, "r1", down)).unwrap();

        let fanout = WriteFanout::new(FanoutAck::Any);
        let err = fanout
            .collect(&mut rx, 3, 5, SubmitMode::DontWait)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, BalancerError::ReplicaDown(ref name) if name == "r1"));
    }

    #[tokio::test]
    async fn test_collect_any_dont_wait_all_succeeded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["r1", "r2"] {
            tx.send(completion(6, name, Ok(json!({"affected": 1})))).unwrap();
        }
        let output = WriteFanout::new(FanoutAck::Any)
            .collect(&mut rx, 2, 6, SubmitMode::DontWait)
            .await
            .unwrap();
        assert_eq!(output, json!({"affected": 1}));
    }

    #[tokio::test]
    async fn test_collect_all_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(completion(4, "r1", Ok(json!({"affected": 1})))).unwrap();
        tx.send(completion(4, "r2", failed("r2"))).unwrap();
        tx.send(completion(4, "r3", Ok(json!({"affected": 1})))).unwrap();

        let fanout = WriteFanout::new(FanoutAck::All);
        let err = fanout.collect(&mut rx, 3, 4, SubmitMode::DontWait).await.unwrap_err();
        assert_eq!(err.replica(), Some("r2"));
    }

    #[tokio::test]
    async fn test_collect_all_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["r1", "r2"] {
            tx.send(completion(4, name, Ok(json!({"affected": 0})))).unwrap();
        }
        let fanout = WriteFanout::new(FanoutAck::All);
        let output = fanout.collect(&mut rx, 2, 4, SubmitMode::Wait).await.unwrap();
        assert_eq!(output, json!({"affected": 0}));
    }

    #[tokio::test]
    async fn test_collect_ignores_other_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(completion(9, "r1", Ok(json!("stale")))).unwrap();
        tx.send(completion(2, "r1", Ok(json!("mine")))).unwrap();

        let output = WriteFanout::default()
            .collect(&mut rx, 1, 2, SubmitMode::Wait)
            .await
            .unwrap();
        assert_eq!(output, json!("mine"));
    }

    #[tokio::test]
    async fn test_collect_channel_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        drop(tx);
        let err = WriteFanout::new(FanoutAck::All)
            .collect(&mut rx, 2, 3, SubmitMode::Wait)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Abandoned(3)));
    }
}
