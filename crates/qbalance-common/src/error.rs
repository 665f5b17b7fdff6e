use crate::command::{CommandId, CommandKind};
use thiserror::Error;

/// Errors a backend call can produce.
///
/// The variants follow the usual database driver taxonomy. Which of them
/// count as transient depends on the backend family; see
/// [`FamilyClassifier`](crate::backend::FamilyClassifier).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("operational error: {0}")]
    Operational(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error("backend call timed out after {0}ms")]
    Timeout(u64),

    #[error("data error: {0}")]
    Data(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("programming error: {0}")]
    Programming(String),

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the balancer to the submitting caller.
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("replica {replica} is unavailable: {source}")]
    Transient {
        replica: String,
        #[source]
        source: BackendError,
    },

    #[error("replica {0} is down")]
    ReplicaDown(String),

    #[error("backend error on replica {replica}: {source}")]
    Backend {
        replica: String,
        #[source]
        source: BackendError,
    },

    #[error("no eligible replica after waiting {waited_ms}ms")]
    NoEligibleReplica { waited_ms: u64 },

    #[error("no replicas configured")]
    NoReplicas,

    #[error("no executor registered for {0} commands")]
    MissingExecutor(CommandKind),

    #[error("command {id} timed out after {after_ms}ms")]
    Timeout { id: CommandId, after_ms: u64 },

    #[error("command {0} was abandoned before completion")]
    Abandoned(CommandId),

    #[error("balancer has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BalancerError {
    /// Whether the failure reflects temporary unavailability, so the same
    /// command may succeed if submitted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BalancerError::Transient { .. }
                | BalancerError::ReplicaDown(_)
                | BalancerError::NoEligibleReplica { .. }
        )
    }

    /// The replica the error originated from, if any.
    pub fn replica(&self) -> Option<&str> {
        match self {
            BalancerError::Transient { replica, .. } | BalancerError::Backend { replica, .. } => {
                Some(replica)
            }
            BalancerError::ReplicaDown(replica) => Some(replica),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BalancerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(BalancerError::Transient {
            replica: "r1".to_string(),
            source: BackendError::Operational("connection reset".to_string()),
        }
        .is_transient());
        assert!(BalancerError::ReplicaDown("r1".to_string()).is_transient());
        assert!(BalancerError::NoEligibleReplica { waited_ms: 10 }.is_transient());

        assert!(!BalancerError::Backend {
            replica: "r1".to_string(),
            source: BackendError::Integrity("duplicate key".to_string()),
        }
        .is_transient());
        assert!(!BalancerError::NoReplicas.is_transient());
        assert!(!BalancerError::Abandoned(3).is_transient());
        assert!(!BalancerError::ShutDown.is_transient());
    }

    #[test]
    fn test_replica_accessor() {
        let err = BalancerError::Backend {
            replica: "r2".to_string(),
            source: BackendError::Data("bad row".to_string()),
        };
        assert_eq!(err.replica(), Some("r2"));
        assert_eq!(BalancerError::NoReplicas.replica(), None);
    }

    #[test]
    fn test_display() {
        let err = BalancerError::Transient {
            replica: "r1".to_string(),
            source: BackendError::Timeout(250),
        };
        assert_eq!(
            err.to_string(),
            "replica r1 is unavailable: backend call timed out after 250ms"
        );
        assert_eq!(
            BalancerError::MissingExecutor(CommandKind::RowReturning).to_string(),
            "no executor registered for row-returning commands"
        );
    }
}
