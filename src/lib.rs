#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod builder;
mod config;
mod errors;
mod handler;
/// Schedule expression parsing and next-run computation.
pub mod interval;
mod job_registry;
/// Persisted document model and index definitions.
pub mod schema;
mod scheduler;
mod spec;
mod storage;
mod util;
mod worker;

/// Fluent construction of a job before persisting it.
pub use self::builder::{JobBuilder, RepeatOptions};
/// Runtime configuration for a scheduler node.
pub use self::config::SchedulerConfig;
/// Error type for scheduler, store, and parser operations.
pub use self::errors::Error;
/// The main trait for defining typed job handlers.
pub use self::handler::JobHandler;
/// Name → handler lookup used at dispatch time.
pub use self::job_registry::JobRegistry;
/// The persisted job document.
pub use self::schema::ScheduledJob;
/// The per-node scheduling engine.
pub use self::scheduler::Scheduler;
/// Job definitions and the cancel/persist result types.
pub use self::spec::{
    CancelMode, CancelOptions, CancelQuery, CancelQueryBuilder, CancelResult, JobSpec, JobType,
    PersistResult, Priority,
};
/// MongoDB persistence layer for scheduled jobs.
pub use self::storage::JobStore;
