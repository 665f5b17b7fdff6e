//! qbalance Metrics
//!
//! Per-replica accounting for the balancer: how many commands each replica
//! was handed, how they ended, and how long they took.
//!
//! - [`MetricsRegistry`]: lock-free counters behind a replica map
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! ```rust
//! use qbalance_metrics::{MetricsRegistry, Outcome};
//! use std::time::Duration;
//!
//! let registry = MetricsRegistry::new();
//! registry.record_submitted(false);
//! registry.record_routed("replica-1");
//! registry.record_completion("replica-1", Duration::from_micros(420), Outcome::Success);
//!
//! let snapshot = registry.snapshot();
//! assert_eq!(snapshot.replicas["replica-1"].succeeded, 1);
//! ```

mod histogram;
mod registry;
mod snapshot;

pub use registry::{MetricsRegistry, Outcome};
pub use snapshot::{MetricsSnapshot, ReplicaMetrics};
