//! Durable word-count map-reduce.
//!
//! A job's lines are mapped to `(word, 1)` pairs, shuffled by word, reduced
//! to totals and summarised. The control-flow lives in [`orchestrator`] and
//! only ever talks to the [`host`], which runs each step as a retryable
//! activity on a [`worker`] and checkpoints results so a crashed run can be
//! replayed to where it stopped.

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod orchestrator;
pub mod resolver;
pub mod rpc;
pub mod store;
pub mod task;
pub mod types;
pub mod worker;

pub use error::{ErrorKind, ErrorReport, MrError, Result};
pub use types::{GroupedEntry, InputRecord, JobRequest, MapperOutput, ReducedEntry, RunResult};
