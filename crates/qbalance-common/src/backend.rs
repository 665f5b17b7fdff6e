use crate::command::{Output, Payload};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Database family a backend belongs to. Only used to pick a default
/// [`TransientClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    Postgres,
    MySql,
    Sqlite,
    Generic,
}

impl BackendFamily {
    pub fn default_classifier(self) -> FamilyClassifier {
        FamilyClassifier(self)
    }
}

/// Telemetry readings a backend can report for interval routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryMetric {
    /// Round-trip latency of a trivial statement, in milliseconds.
    Latency,
    /// Number of open client connections on the server.
    Connections,
}

impl fmt::Display for TelemetryMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryMetric::Latency => f.write_str("latency"),
            TelemetryMetric::Connections => f.write_str("connections"),
        }
    }
}

/// Handle to one database backend.
///
/// Implementations wrap whatever connection or pool the host application
/// uses. All methods may be called concurrently.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn family(&self) -> BackendFamily;

    /// Lightweight liveness probe used by the health monitor.
    async fn ping(&self) -> bool;

    /// Reads one telemetry value. Backends that cannot report a metric keep
    /// the default, which makes the replica rank last under interval routing.
    async fn measure(&self, metric: TelemetryMetric) -> Result<f64, BackendError> {
        Err(BackendError::Other(format!(
            "{} telemetry not supported",
            metric
        )))
    }
}

/// Performs the actual backend call for one command kind.
///
/// Must be safe to call concurrently from different replica workers.
#[async_trait]
pub trait Executor<B: Backend>: Send + Sync {
    async fn execute(&self, payload: &Payload, backend: &B) -> Result<Output, BackendError>;
}

/// Decides whether a backend error means "temporarily unavailable".
pub trait TransientClassifier: Send + Sync {
    fn is_transient(&self, error: &BackendError) -> bool;
}

impl<F> TransientClassifier for F
where
    F: Fn(&BackendError) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &BackendError) -> bool {
        self(error)
    }
}

/// Default classifier for a backend family.
///
/// Network-level failures are transient everywhere. Interface errors (the
/// driver lost its socket) count for client/server databases only; embedded
/// SQLite reports a locked database as an operational error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyClassifier(pub BackendFamily);

impl TransientClassifier for FamilyClassifier {
    fn is_transient(&self, error: &BackendError) -> bool {
        match self.0 {
            BackendFamily::Postgres | BackendFamily::MySql => matches!(
                error,
                BackendError::Operational(_) | BackendError::Interface(_) | BackendError::Timeout(_)
            ),
            BackendFamily::Sqlite | BackendFamily::Generic => {
                matches!(error, BackendError::Operational(_) | BackendError::Timeout(_))
            }
        }
    }
}
