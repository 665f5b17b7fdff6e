//! qbalance Router
//!
//! Spreads database commands over a set of replicas of the same data.
//!
//! # Architecture
//!
//! ```text
//! caller -> Dispatcher -> RoutingAlgorithm (reads) | WriteFanout (writes)
//!        -> Replica inbound queue -> worker -> WaitPolicy -> Executor
//!        -> caller's completion channel -> caller
//! ```
//!
//! - [`Dispatcher`]: assigns command ids, picks the path, waits for the result
//! - [`Replica`]: one backend plus its queue, status and signals
//! - [`RoundRobin`] / [`Interval`]: read routing over eligible replicas
//! - [`WriteFanout`]: delivers writes to every replica
//! - [`BlockingRetry`] / [`FailFast`]: what a worker does on transient failure
//! - [`HealthMonitor`]: brings `DOWN` replicas back once they answer a ping
//! - [`BalancerBuilder`]: wires it all together and starts the tasks
//!
//! A replica only ever holds one read at a time. It is eligible for routing
//! when it is running, idle and has nothing queued.

mod builder;
mod config;
mod dispatcher;
mod envelope;
mod fanout;
mod health_monitor;
pub mod memory;
mod replica;
mod routing;
mod signal;
mod telemetry;
mod wait_policy;
mod worker;

pub use builder::BalancerBuilder;
pub use config::{
    BalancerConfig, EligibilityBackoff, FanoutAck, HealthConfig, RoutePolicy, RoutingStrategy,
    TelemetryConfig,
};
pub use dispatcher::Dispatcher;
pub use envelope::{Completion, Envelope, Path};
pub use fanout::WriteFanout;
pub use health_monitor::HealthMonitor;
pub use replica::{Replica, ReplicaReport, ReplicaStatus};
pub use routing::{route_read, Interval, RoundRobin, RoutingAlgorithm};
pub use signal::Signal;
pub use telemetry::TelemetryRefresher;
pub use wait_policy::{BlockingRetry, FailFast, WaitPolicies, WaitPolicy};
pub use worker::{run_worker, ExecutorSet};
