use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use harvest_core::config::{RetentionConfig, RunnerConfig};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::{unknown_job_type_message, Dispatcher, ExecutionContext, Executor},
    retention::run_retention,
    store::JobStore,
    types::{Job, JobStatus, RetentionStats},
};

/// What one tick did. Returned for logging and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Present when a retention pass ran this tick.
    pub cleanup: Option<RetentionStats>,
    /// Jobs handed out by the store.
    pub claimed: usize,
    /// Executions started.
    pub started: usize,
    /// Jobs failed with `UNKNOWN_JOB_TYPE`.
    pub unknown: usize,
    /// Claimed jobs returned to `pending` because the runner was stopping.
    pub requeued: usize,
    /// The tick stopped early on cancellation.
    pub cancelled: bool,
}

/// Polling loop: claims pending jobs up to the concurrency ceiling and starts
/// one execution per job, interleaving retention passes.
///
/// All loop state (slots, last cleanup time, executor table) lives here so a
/// test can drive [`tick`](Runner::tick) directly with its own clock.
pub struct Runner {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    config: RunnerConfig,
    retention: RetentionConfig,
    /// Concurrency slots. A permit is held for the lifetime of one execution.
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    last_cleanup: Option<DateTime<Utc>>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl Runner {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        config: RunnerConfig,
        retention: RetentionConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        let max_concurrent = config.max_concurrent_jobs();
        Self {
            store,
            dispatcher: Arc::new(dispatcher),
            config,
            retention,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            last_cleanup: None,
            tracker: TaskTracker::new(),
            shutdown_token,
        }
    }

    /// Executions currently holding a slot.
    pub fn running(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Free slots, i.e. how many jobs the next tick may claim.
    pub fn capacity(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        self.last_cleanup
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Main loop. Ticks every poll interval until the shutdown token fires.
    ///
    /// Returns without waiting for in-flight executions; call
    /// [`drain`](Runner::drain) for that.
    pub async fn run(&mut self) {
        info!(
            max_concurrent = self.max_concurrent,
            poll_ms = self.config.poll_interval().as_millis() as u64,
            executors = self.dispatcher.len(),
            retention = self.retention.enabled,
            "job runner started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown_token.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("job runner shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if report.claimed > 0 {
                        debug!(
                            claimed = report.claimed,
                            started = report.started,
                            unknown = report.unknown,
                            running = self.running(),
                            "tick"
                        );
                    }
                    if report.cancelled {
                        info!(requeued = report.requeued, "job runner shutting down");
                        break;
                    }
                }
            }
        }
        self.tracker.close();
    }

    /// Wait up to `grace` for in-flight executions. Returns `true` when all of
    /// them finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight == 0 {
            return true;
        }
        info!(in_flight, grace_secs = grace.as_secs(), "waiting for in-flight jobs");
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "grace period elapsed with jobs still running"
                );
                false
            }
        }
    }

    /// One cycle: maybe clean up, then claim and dispatch up to capacity.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if self.shutdown_token.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        if self.cleanup_due(now) {
            report.cleanup = Some(run_retention(self.store.as_ref(), &self.retention, now).await);
            self.last_cleanup = Some(now);
        }

        let capacity = self.capacity();
        if capacity == 0 {
            debug!(running = self.running(), "at concurrency ceiling, skipping claim");
            return report;
        }

        // The retention pass may have taken a while; re-check before claiming.
        if self.shutdown_token.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let jobs = match self.store.list_pending_jobs(capacity).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, code = e.code(), "listing pending jobs failed, retrying next tick");
                return report;
            }
        };
        report.claimed = jobs.len();

        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            let Some(executor) = self.dispatcher.get(&job.job_type) else {
                self.fail_unknown(&job).await;
                report.unknown += 1;
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => None,
                permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                // Stopping: hand this job and the rest of the batch back.
                report.cancelled = self.shutdown_token.is_cancelled();
                for job in std::iter::once(job).chain(jobs.by_ref()) {
                    self.requeue(&job).await;
                    report.requeued += 1;
                }
                break;
            };

            self.spawn_execution(executor, job, permit);
            report.started += 1;
        }
        report
    }

    fn cleanup_due(&self, now: DateTime<Utc>) -> bool {
        if !self.retention.enabled {
            return false;
        }
        match self.last_cleanup {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.retention.cleanup_interval()),
        }
    }

    async fn fail_unknown(&self, job: &Job) {
        let message = unknown_job_type_message(&job.job_type);
        warn!(job_id = %job.id, job_type = %job.job_type, "no executor registered for job type");
        if let Err(e) = self
            .store
            .update_job_status(&job.id, JobStatus::Failed, Some(&message))
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to mark unknown-type job as failed");
        }
    }

    async fn requeue(&self, job: &Job) {
        match self.store.requeue_job(&job.id).await {
            Ok(()) => debug!(job_id = %job.id, "claimed job requeued"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to requeue claimed job"),
        }
    }

    /// Start `job` on the tracker. The permit moves into the task and is
    /// released when the execution ends, including by panic.
    fn spawn_execution(&self, executor: Arc<dyn Executor>, job: Job, permit: OwnedSemaphorePermit) {
        let ctx = ExecutionContext::new(self.shutdown_token.child_token(), Arc::clone(&self.store));
        let job_id = job.id.clone();
        let job_type = job.job_type.clone();
        info!(job_id = %job_id, job_type = %job_type, priority = job.priority, "dispatching job");

        self.tracker.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let outcome = AssertUnwindSafe(executor.execute(ctx, job))
                .catch_unwind()
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(()) => debug!(job_id = %job_id, job_type = %job_type, elapsed_ms, "execution finished"),
                // The executor never wrote a terminal status; the job stays
                // running until someone intervenes.
                Err(panic) => error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    elapsed_ms,
                    panic = %panic_message(panic.as_ref()),
                    "executor panicked"
                ),
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{JobsError, Result};
    use crate::types::{JobType, NewJob};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store that records calls and can be told to fail listing.
    #[derive(Default)]
    struct FakeStore {
        pending: Mutex<Vec<Job>>,
        list_calls: AtomicUsize,
        fail_list: Mutex<bool>,
        statuses: Mutex<Vec<(String, JobStatus, Option<String>)>>,
        requeued: Mutex<Vec<String>>,
        retention_calls: AtomicUsize,
        cancel_on_list: Mutex<Option<CancellationToken>>,
    }

    impl FakeStore {
        fn push(&self, job_type: &str) -> String {
            let now = Utc::now();
            let new = NewJob::new(job_type, "https://example.test");
            let job = Job {
                id: uuid::Uuid::now_v7().to_string(),
                job_type: new.job_type,
                status: JobStatus::Pending,
                priority: new.priority,
                url: new.url,
                input: new.input,
                error: None,
                claimed_by: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            };
            let id = job.id.clone();
            self.pending.lock().unwrap().push(job);
            id
        }
    }

    #[async_trait]
    impl JobStore for FakeStore {
        async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = self.cancel_on_list.lock().unwrap().as_ref() {
                token.cancel();
            }
            if *self.fail_list.lock().unwrap() {
                return Err(JobsError::Task("connection reset".into()));
            }
            let mut pending = self.pending.lock().unwrap();
            let n = limit.min(pending.len());
            Ok(pending
                .drain(..n)
                .map(|mut j| {
                    j.status = JobStatus::Running;
                    j
                })
                .collect())
        }
        async fn update_job_status(
            &self,
            id: &str,
            status: JobStatus,
            error: Option<&str>,
        ) -> Result<()> {
            self.statuses
                .lock()
                .unwrap()
                .push((id.to_string(), status, error.map(str::to_string)));
            Ok(())
        }
        async fn delete_expired_documents(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
            self.retention_calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
        async fn delete_expired_jobs_by_type(
            &self,
            _job_type: &JobType,
            _cutoff: DateTime<Utc>,
        ) -> Result<u64> {
            Ok(0)
        }
        async fn requeue_job(&self, id: &str) -> Result<()> {
            self.requeued.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn list_job_types(&self) -> Result<Vec<JobType>> {
            Ok(Vec::new())
        }
    }

    struct CompleteImmediately;

    #[async_trait]
    impl Executor for CompleteImmediately {
        async fn execute(&self, ctx: ExecutionContext, job: Job) {
            ctx.complete(&job.id).await.unwrap();
        }
    }

    /// Holds its slot until the shared semaphore releases a permit.
    struct Gated(Arc<Semaphore>);

    #[async_trait]
    impl Executor for Gated {
        async fn execute(&self, ctx: ExecutionContext, job: Job) {
            let _ = self.0.acquire().await.map(|p| p.forget());
            ctx.complete(&job.id).await.unwrap();
        }
    }

    struct Panics;

    #[async_trait]
    impl Executor for Panics {
        async fn execute(&self, _ctx: ExecutionContext, _job: Job) {
            panic!("executor blew up");
        }
    }

    fn runner_with(
        store: Arc<FakeStore>,
        dispatcher: Dispatcher,
        max: i64,
        retention_enabled: bool,
    ) -> Runner {
        let config = RunnerConfig {
            max_concurrent_jobs: max,
            ..RunnerConfig::default()
        };
        let retention = RetentionConfig {
            enabled: retention_enabled,
            ..RetentionConfig::default()
        };
        Runner::new(store, dispatcher, config, retention, CancellationToken::new())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn unknown_type_fails_without_taking_a_slot() {
        let store = Arc::new(FakeStore::default());
        let id = store.push("unknown_x");
        let mut runner = runner_with(Arc::clone(&store), Dispatcher::new(), 2, false);

        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.unknown, 1);
        assert_eq!(report.started, 0);
        assert_eq!(runner.capacity(), 2);

        let statuses = store.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, id);
        assert_eq!(statuses[0].1, JobStatus::Failed);
        assert_eq!(statuses[0].2.as_deref(), Some("UNKNOWN_JOB_TYPE: unknown_x"));
    }

    #[tokio::test]
    async fn capacity_bounds_claims_and_slots_are_released() {
        let store = Arc::new(FakeStore::default());
        for _ in 0..5 {
            store.push("scrape");
        }
        let gate = Arc::new(Semaphore::new(0));
        let dispatcher = Dispatcher::new()
            .with(JobType::Scrape, Arc::new(Gated(Arc::clone(&gate))))
            .unwrap();
        let mut runner = runner_with(Arc::clone(&store), dispatcher, 2, false);

        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.started, 2);
        assert_eq!(runner.running(), 2);

        // At the ceiling: the store is not even asked.
        let calls = store.list_calls.load(Ordering::SeqCst);
        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.claimed, 0);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), calls);

        gate.add_permits(1);
        wait_until(|| runner.running() == 1).await;

        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.started, 1);
        assert_eq!(runner.running(), 2);
        assert_eq!(store.pending.lock().unwrap().len(), 2);

        gate.add_permits(10);
        wait_until(|| runner.running() == 0).await;
    }

    #[tokio::test]
    async fn list_failure_is_transient() {
        let store = Arc::new(FakeStore::default());
        store.push("scrape");
        *store.fail_list.lock().unwrap() = true;
        let dispatcher = Dispatcher::new()
            .with(JobType::Scrape, Arc::new(CompleteImmediately))
            .unwrap();
        let mut runner = runner_with(Arc::clone(&store), dispatcher, 4, false);

        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.claimed, 0);
        assert!(!report.cancelled);

        *store.fail_list.lock().unwrap() = false;
        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.started, 1);
        wait_until(|| store.statuses.lock().unwrap().len() == 1).await;
        assert_eq!(store.statuses.lock().unwrap()[0].1, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_before_claim_issues_no_claim() {
        let store = Arc::new(FakeStore::default());
        store.push("scrape");
        let mut runner = runner_with(Arc::clone(&store), Dispatcher::new(), 4, true);

        runner.shutdown_token().cancel();
        let report = runner.tick(Utc::now()).await;
        assert!(report.cancelled);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.retention_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_returns_promptly_once_cancelled() {
        let store = Arc::new(FakeStore::default());
        let mut runner = runner_with(Arc::clone(&store), Dispatcher::new(), 1, false);
        let token = runner.shutdown_token();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), runner.run())
            .await
            .expect("run did not stop");
        assert!(runner.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn panicking_executor_releases_its_slot() {
        let store = Arc::new(FakeStore::default());
        store.push("crawl");
        store.push("scrape");
        let dispatcher = Dispatcher::new()
            .with(JobType::Crawl, Arc::new(Panics))
            .unwrap()
            .with(JobType::Scrape, Arc::new(CompleteImmediately))
            .unwrap();
        let mut runner = runner_with(Arc::clone(&store), dispatcher, 2, false);

        let report = runner.tick(Utc::now()).await;
        assert_eq!(report.started, 2);
        wait_until(|| runner.running() == 0).await;

        // Only the healthy executor reported; the loop keeps going.
        let statuses = store.statuses.lock().unwrap().clone();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, JobStatus::Completed);
        drop(statuses);
        assert!(!runner.tick(Utc::now()).await.cancelled);
    }

    #[tokio::test]
    async fn cleanup_runs_first_tick_then_waits_for_interval() {
        let store = Arc::new(FakeStore::default());
        let mut runner = runner_with(Arc::clone(&store), Dispatcher::new(), 1, true);
        let t0 = Utc::now();

        assert!(runner.tick(t0).await.cleanup.is_some());
        assert_eq!(runner.last_cleanup(), Some(t0));
        assert!(runner
            .tick(t0 + chrono::Duration::minutes(59))
            .await
            .cleanup
            .is_none());
        assert!(runner
            .tick(t0 + chrono::Duration::minutes(60))
            .await
            .cleanup
            .is_some());
        assert_eq!(store.retention_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleanup_disabled_never_runs() {
        let store = Arc::new(FakeStore::default());
        let mut runner = runner_with(Arc::clone(&store), Dispatcher::new(), 1, false);
        assert!(runner.tick(Utc::now()).await.cleanup.is_none());
        assert_eq!(store.retention_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn claimed_jobs_are_requeued_when_cancelled_mid_dispatch() {
        let store = Arc::new(FakeStore::default());
        let a = store.push("scrape");
        let b = store.push("scrape");
        let dispatcher = Dispatcher::new()
            .with(JobType::Scrape, Arc::new(CompleteImmediately))
            .unwrap();
        let mut runner = runner_with(Arc::clone(&store), dispatcher, 4, false);

        // Shutdown arrives while the claim is in flight.
        *store.cancel_on_list.lock().unwrap() = Some(runner.shutdown_token());
        let report = runner.tick(Utc::now()).await;

        assert!(report.cancelled);
        assert_eq!(report.claimed, 2);
        assert_eq!(report.started, 0);
        assert_eq!(report.requeued, 2);
        assert_eq!(*store.requeued.lock().unwrap(), vec![a, b]);
        assert_eq!(runner.running(), 0);
    }
}
