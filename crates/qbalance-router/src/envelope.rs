use qbalance_common::{BalancerError, Command, CommandId, Output, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the balancer a command travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Path {
    /// Routed to a single replica.
    Read,
    /// Delivered to every replica.
    Write,
}

/// Result of one command on one replica.
#[derive(Debug)]
pub struct Completion {
    pub id: CommandId,
    pub replica: String,
    pub result: Result<Output>,
}

/// One delivery of a command to one replica's inbound queue.
///
/// Carries the submitting caller's private completion channel, so results
/// are never seen by, or lost to, other callers.
#[derive(Debug)]
pub struct Envelope {
    id: CommandId,
    command: Arc<Command>,
    path: Path,
    reply: mpsc::UnboundedSender<Completion>,
}

impl Envelope {
    pub fn new(
        id: CommandId,
        command: Arc<Command>,
        path: Path,
        reply: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            id,
            command,
            path,
            reply,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn path(&self) -> Path {
        self.path
    }

    /// A read whose caller stopped waiting can be dropped. Writes are always
    /// carried through so every replica applies them.
    pub fn is_abandoned(&self) -> bool {
        self.path == Path::Read && self.reply.is_closed()
    }

    /// Resolves once the caller has gone away. Never resolves for writes.
    pub async fn abandoned(&self) {
        match self.path {
            Path::Read => self.reply.closed().await,
            Path::Write => std::future::pending().await,
        }
    }

    pub fn abandon_error(&self) -> BalancerError {
        BalancerError::Abandoned(self.id)
    }

    /// Posts the result to the caller. A caller that already returned (first
    /// fan-out acknowledgement, timeout) is not an error.
    pub fn complete(self, replica: &str, result: Result<Output>) {
        let completion = Completion {
            id: self.id,
            replica: replica.to_string(),
            result,
        };
        if self.reply.send(completion).is_err() {
            tracing::trace!("caller for command {} no longer waiting", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(path: Path) -> (Envelope, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let command = Arc::new(Command::read(json!({"get": "k"})));
        (Envelope::new(11, command, path, tx), rx)
    }

    #[tokio::test]
    async fn test_complete_delivers_to_caller() {
        let (envelope, mut rx) = envelope(Path::Read);
        envelope.complete("r1", Ok(json!(1)));
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.id, 11);
        assert_eq!(completion.replica, "r1");
        assert_eq!(completion.result.unwrap(), json!(1));
    }

    #[test]
    fn test_read_abandoned_when_caller_drops() {
        let (envelope, rx) = envelope(Path::Read);
        assert!(!envelope.is_abandoned());
        drop(rx);
        assert!(envelope.is_abandoned());
    }

    #[test]
    fn test_write_never_abandoned() {
        let (envelope, rx) = envelope(Path::Write);
        drop(rx);
        assert!(!envelope.is_abandoned());
        // Completing after the caller left is silently ignored.
        envelope.complete("r1", Ok(json!(null)));
    }
}
