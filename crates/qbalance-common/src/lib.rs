//! qbalance Common Types
//!
//! This crate holds the vocabulary shared by every qbalance component:
//!
//! - [`command`] - the unit of work submitted to the balancer
//! - [`backend`] - the narrow interfaces to the database side (backend
//!   handles, executors, transient-error classifiers)
//! - [`error`] - backend and balancer error taxonomies
//!
//! # Example
//!
//! ```
//! use qbalance_common::{Command, CommandKind, SubmitMode};
//! use serde_json::json;
//!
//! let command = Command::read(json!({"get": "user:1"})).with_mode(SubmitMode::DontWait);
//! assert_eq!(command.kind(), CommandKind::RowReturning);
//! assert!(command.id().is_none());
//! ```

pub mod backend;
pub mod command;
pub mod error;

pub use backend::{
    Backend, BackendFamily, Executor, FamilyClassifier, TelemetryMetric, TransientClassifier,
};
pub use command::{Command, CommandId, CommandKind, Output, Payload, SubmitMode};
pub use error::{BackendError, BalancerError, Result};
