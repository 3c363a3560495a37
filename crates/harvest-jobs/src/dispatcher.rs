use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::{JobsError, Result},
    store::JobStore,
    types::{Job, JobStatus, JobType},
};

/// Error prefix written for jobs whose type has no registered executor.
pub const UNKNOWN_JOB_TYPE: &str = "UNKNOWN_JOB_TYPE";

/// `UNKNOWN_JOB_TYPE: <type>`, the terminal error for unroutable jobs.
pub fn unknown_job_type_message(job_type: &JobType) -> String {
    format!("{UNKNOWN_JOB_TYPE}: {job_type}")
}

/// Everything an executor gets besides the job itself.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Cancelled when the runner shuts down. Executors should stop early and
    /// still write a terminal status.
    pub cancellation_token: CancellationToken,

    /// Store used to report the job's terminal status.
    pub store: Arc<dyn JobStore>,
}

impl ExecutionContext {
    pub fn new(cancellation_token: CancellationToken, store: Arc<dyn JobStore>) -> Self {
        Self {
            cancellation_token,
            store,
        }
    }

    /// Mark `job_id` completed.
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        self.store
            .update_job_status(job_id, JobStatus::Completed, None)
            .await
    }

    /// Mark `job_id` failed with `reason`.
    pub async fn fail(&self, job_id: &str, reason: &str) -> Result<()> {
        self.store
            .update_job_status(job_id, JobStatus::Failed, Some(reason))
            .await
    }

    /// Hand `job_id` back to `pending` unfinished, e.g. when interrupted by
    /// shutdown, so another tick or worker runs it again.
    pub async fn requeue(&self, job_id: &str) -> Result<()> {
        self.store.requeue_job(job_id).await
    }
}

/// Performs the work for one job type.
///
/// The runner does not await a result: the executor owns the job from here
/// and must write `completed` or `failed` through [`ExecutionContext`]. Retry
/// and timeout policy, if any, live inside the executor.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext, job: Job);
}

/// Registry from job type tag to executor.
#[derive(Default, Clone)]
pub struct Dispatcher {
    executors: HashMap<JobType, Arc<dyn Executor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `job_type`.
    ///
    /// Rejects malformed tags and duplicate registrations so configuration
    /// typos surface at startup instead of as failed jobs.
    pub fn register(
        &mut self,
        job_type: impl Into<JobType>,
        executor: Arc<dyn Executor>,
    ) -> Result<()> {
        let job_type = job_type.into();
        if !job_type.is_well_formed() {
            return Err(JobsError::InvalidJobType(job_type.to_string()));
        }
        if self.executors.contains_key(&job_type) {
            return Err(JobsError::DuplicateExecutor(job_type.to_string()));
        }
        info!(%job_type, "executor registered");
        self.executors.insert(job_type, executor);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, job_type: impl Into<JobType>, executor: Arc<dyn Executor>) -> Result<Self> {
        self.register(job_type, executor)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn Executor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.executors.contains_key(job_type)
    }

    /// Registered types in sorted order.
    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
