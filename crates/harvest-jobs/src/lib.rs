//! `harvest-jobs` — persistent, at-least-once job queue with SQLite storage.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table. The [`runner::Runner`] ticks on an
//! interval, claims as many pending jobs as it has free concurrency slots, and
//! hands each one to the executor registered for its type in the
//! [`dispatcher::Dispatcher`]. Executors write the terminal status themselves.
//! Between ticks the runner periodically runs a retention pass that purges
//! expired jobs and documents.
//!
//! # Job lifecycle
//!
//! | From      | To          | Written by                                  |
//! |-----------|-------------|---------------------------------------------|
//! | —         | `pending`   | whoever enqueues the job                    |
//! | `pending` | `running`   | the claim in [`store::JobStore::list_pending_jobs`] |
//! | `running` | `completed` | the executor                                |
//! | `running` | `failed`    | the executor, or the runner for unknown types |
//! | `running` | `pending`   | the runner, for claims it never started before shutdown |

pub mod db;
pub mod dispatcher;
pub mod error;
pub mod retention;
pub mod runner;
pub mod store;
pub mod types;

pub use dispatcher::{Dispatcher, ExecutionContext, Executor};
pub use error::{JobsError, Result};
pub use retention::run_retention;
pub use runner::{Runner, TickReport};
pub use store::{JobStore, SqliteJobStore};
pub use types::{Job, JobStatus, JobType, NewJob, RetentionStats};
