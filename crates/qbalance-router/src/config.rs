use qbalance_common::{BalancerError, Result, TelemetryMetric};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How read commands pick a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    /// Eligible replica with the lowest measured latency.
    LowestLatency,
    /// Eligible replica with the fewest open connections.
    FewestConnections,
}

impl RoutingStrategy {
    /// The telemetry reading the strategy needs refreshed, if any.
    pub fn telemetry_metric(self) -> Option<TelemetryMetric> {
        match self {
            RoutingStrategy::RoundRobin => None,
            RoutingStrategy::LowestLatency => Some(TelemetryMetric::Latency),
            RoutingStrategy::FewestConnections => Some(TelemetryMetric::Connections),
        }
    }
}

/// What decides between the read path and write fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutePolicy {
    /// Row-returning commands are routed, everything else fans out.
    #[default]
    #[serde(rename = "kind")]
    ByKind,
    /// `DontWait` commands are routed, `Wait` commands fan out.
    #[serde(rename = "mode")]
    ByMode,
}

/// When a fanned-out write returns to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutAck {
    /// First successful replica, or the first error once every replica failed.
    #[default]
    Any,
    /// Every replica; the first failure wins.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            probe_timeout_ms: 2000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            probe_timeout_ms: 2000,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Backoff between eligibility scans while every replica is down or busy.
///
/// The first rescan waits `initial_backoff_ms`, each later one waits
/// `previous * backoff_multiplier` capped at `max_backoff_ms`. After
/// `max_wait_ms` in total the read fails with `NoEligibleReplica`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityBackoff {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_wait_ms: u64,
}

impl Default for EligibilityBackoff {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            max_wait_ms: 5000,
        }
    }
}

impl EligibilityBackoff {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next_ms.min(self.max_backoff_ms))
    }
}

/// Balancer configuration. Fixed once the balancer is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub routing: RoutingStrategy,
    pub route_by: RoutePolicy,
    pub fanout_ack: FanoutAck,
    pub health: HealthConfig,
    pub telemetry: TelemetryConfig,
    pub eligibility: EligibilityBackoff,
    /// Upper bound on how long `submit` waits for a result. Unbounded when unset.
    pub submit_timeout_ms: Option<u64>,
}

impl BalancerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BalancerError::InvalidConfig(msg.to_string()));

        if self.health.interval_ms == 0 {
            return invalid("health.interval_ms must be greater than 0");
        }
        if self.health.probe_timeout_ms == 0 {
            return invalid("health.probe_timeout_ms must be greater than 0");
        }
        if self.routing.telemetry_metric().is_some() {
            if self.telemetry.interval_ms == 0 {
                return invalid("telemetry.interval_ms must be greater than 0");
            }
            if self.telemetry.probe_timeout_ms == 0 {
                return invalid("telemetry.probe_timeout_ms must be greater than 0");
            }
        }
        let backoff = &self.eligibility;
        if backoff.initial_backoff_ms == 0 {
            return invalid("eligibility.initial_backoff_ms must be greater than 0");
        }
        if backoff.max_backoff_ms < backoff.initial_backoff_ms {
            return invalid("eligibility.max_backoff_ms must not be below initial_backoff_ms");
        }
        if backoff.backoff_multiplier.is_nan() || backoff.backoff_multiplier < 1.0 {
            return invalid("eligibility.backoff_multiplier must be at least 1.0");
        }
        if self.submit_timeout_ms == Some(0) {
            return invalid("submit_timeout_ms must be greater than 0 when set");
        }
        Ok(())
    }
}
