// Copyright 2025 qbalance Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Simulated workloads against in-memory replicas.
//!
//! Each replica is a [`MemoryBackend`] with its own copy of the table. The
//! workload is a fixed mix of `set` statements and `get` queries submitted
//! with bounded concurrency. An [`Outage`] takes one replica offline for a
//! while, which exercises the down/restore cycle under load.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use qbalance_common::{BalancerError, Command, CommandKind, SubmitMode};
use qbalance_router::memory::{MemoryBackend, MemoryQuery, MemoryStatement};
use qbalance_router::{BalancerBuilder, BalancerConfig};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Takes replica `replica` offline `after` the workload starts, for `duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outage {
    pub replica: usize,
    pub after: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub replicas: usize,
    pub reads: usize,
    pub writes: usize,
    pub concurrency: usize,
    pub mode: SubmitMode,
    /// Added to every backend call.
    pub latency: Duration,
    pub outage: Option<Outage>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            replicas: 3,
            reads: 100,
            writes: 10,
            concurrency: 8,
            mode: SubmitMode::Wait,
            latency: Duration::from_millis(1),
            outage: None,
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures by error kind.
    pub errors: BTreeMap<&'static str, usize>,
    pub elapsed_ms: u64,
    /// Keys each replica holds at the end of the run.
    pub table_sizes: BTreeMap<String, usize>,
    /// `Dispatcher::info` at the end of the run.
    pub balancer: serde_json::Value,
}

/// Short name of an error variant, for the report.
pub fn error_kind(error: &BalancerError) -> &'static str {
    match error {
        BalancerError::Transient { .. } => "transient",
        BalancerError::ReplicaDown(_) => "replica_down",
        BalancerError::Backend { .. } => "backend",
        BalancerError::NoEligibleReplica { .. } => "no_eligible_replica",
        BalancerError::NoReplicas => "no_replicas",
        BalancerError::MissingExecutor(_) => "missing_executor",
        BalancerError::Timeout { .. } => "timeout",
        BalancerError::Abandoned(_) => "abandoned",
        BalancerError::ShutDown => "shut_down",
        BalancerError::InvalidConfig(_) => "invalid_config",
        BalancerError::Json(_) => "json",
        BalancerError::Io(_) => "io",
    }
}

/// The command mix: writes spread evenly among the reads. Reads target keys
/// that some write sets.
pub fn workload(options: &SimulationOptions) -> Vec<Command> {
    let total = options.reads + options.writes;
    let stride = if options.writes == 0 {
        usize::MAX
    } else {
        (total / options.writes).max(1)
    };
    let keys = options.writes.max(1);

    let mut commands = Vec::with_capacity(total);
    let (mut reads, mut writes) = (0, 0);
    for i in 0..total {
        let write_turn = i % stride == 0 && writes < options.writes;
        let command = if write_turn || reads == options.reads {
            writes += 1;
            Command::write(json!({"set": format!("key-{}", writes - 1), "value": i}))
        } else {
            reads += 1;
            Command::read(json!({"get": format!("key-{}", reads % keys)}))
        };
        commands.push(command.with_mode(options.mode));
    }
    commands
}

/// Runs the workload against fresh in-memory replicas.
pub async fn run(config: BalancerConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    if options.replicas == 0 {
        anyhow::bail!("at least one replica is required");
    }
    if let Some(outage) = &options.outage {
        if outage.replica >= options.replicas {
            anyhow::bail!(
                "outage replica index {} out of range (0..{})",
                outage.replica,
                options.replicas
            );
        }
    }

    let backends: Vec<Arc<MemoryBackend>> = (0..options.replicas)
        .map(|_| Arc::new(MemoryBackend::new().with_latency(options.latency)))
        .collect();
    let mut builder = BalancerBuilder::new(config)
        .executor(CommandKind::RowReturning, MemoryQuery)
        .executor(CommandKind::NonRowReturning, MemoryStatement);
    for (i, backend) in backends.iter().enumerate() {
        builder = builder.shared_replica(format!("replica-{}", i), Arc::clone(backend));
    }
    let dispatcher = builder.build()?;

    let outage = options.outage.clone().map(|outage| {
        let backend = Arc::clone(&backends[outage.replica]);
        tokio::spawn(async move {
            tokio::time::sleep(outage.after).await;
            info!(
                "Taking replica-{} offline for {}ms",
                outage.replica,
                outage.duration.as_millis()
            );
            backend.set_online(false);
            tokio::time::sleep(outage.duration).await;
            backend.set_online(true);
            info!("replica-{} back online", outage.replica);
        })
    });

    let commands = workload(options);
    let submitted = commands.len();
    let started = Instant::now();
    let results: Vec<_> = stream::iter(commands)
        .map(|command| dispatcher.submit_command(command))
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    let elapsed = started.elapsed();

    if let Some(outage) = outage {
        outage.await?;
    }

    let mut errors = BTreeMap::new();
    let mut succeeded = 0;
    for result in &results {
        match result {
            Ok(_) => succeeded += 1,
            Err(e) => *errors.entry(error_kind(e)).or_insert(0) += 1,
        }
    }

    let table_sizes = backends
        .iter()
        .enumerate()
        .map(|(i, backend)| (format!("replica-{}", i), backend.len()))
        .collect();
    let balancer = dispatcher.info();
    dispatcher.shutdown();

    info!(
        "Simulation finished: {}/{} succeeded in {}ms",
        succeeded,
        submitted,
        elapsed.as_millis()
    );

    Ok(SimulationReport {
        submitted,
        succeeded,
        failed: submitted - succeeded,
        errors,
        elapsed_ms: elapsed.as_millis() as u64,
        table_sizes,
        balancer,
    })
}
