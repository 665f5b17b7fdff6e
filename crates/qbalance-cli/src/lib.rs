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

//! # qbalance CLI
//!
//! Command-line driver for the qbalance replica load balancer.
//!
//! The balancer itself is a library; this crate lets you exercise it against
//! in-memory replicas and check configuration files before deploying them.
//!
//! ## Key Commands
//!
//! - `qbalance simulate`: run a read/write workload, optionally knocking a
//!   replica offline part way through, and print the outcome as JSON
//! - `qbalance check-config`: parse and validate a JSON config file and print
//!   it with every default filled in

pub mod simulate;
