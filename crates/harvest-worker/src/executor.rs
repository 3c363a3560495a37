//! Executor that hands each job to an external program.
//!
//! The child gets the job record as JSON on stdin plus `HARVEST_JOB_ID`,
//! `HARVEST_JOB_TYPE` and `HARVEST_JOB_URL` in its environment. Exit code 0
//! completes the job; anything else fails it with the tail of stderr. A
//! child still running at shutdown is killed and its job goes back to
//! `pending` for the next worker.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::config::ExecutorConfig;
use harvest_jobs::{ExecutionContext, Executor, Job};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Longest stderr excerpt stored in `jobs.error`.
pub const MAX_ERROR_CHARS: usize = 2_000;

pub struct CommandExecutor {
    config: ExecutorConfig,
}

enum Outcome {
    Exited(std::io::Result<std::process::Output>),
    TimedOut(Duration),
    Cancelled,
}

/// How a job's run ended, as recorded in the store.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Completed,
    Failed(String),
    /// Interrupted by shutdown; the work is handed back unfinished.
    Abandoned,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Spawn the child and wait for it, the deadline, or cancellation.
    ///
    /// The child is spawned with `kill_on_drop`, so abandoning the wait on
    /// the timeout and cancel paths also kills it.
    async fn run_child(&self, ctx: &ExecutionContext, job: &Job) -> Verdict {
        let payload = match serde_json::to_vec(job) {
            Ok(payload) => payload,
            Err(e) => return Verdict::Failed(format!("encode job: {e}")),
        };

        let spawned = Command::new(&self.config.command)
            .args(&self.config.args)
            .env("HARVEST_JOB_ID", &job.id)
            .env("HARVEST_JOB_TYPE", job.job_type.as_str())
            .env("HARVEST_JOB_URL", &job.url)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Verdict::Failed(format!("SPAWN_FAILED: {}: {e}", self.config.command))
            }
        };

        // Feed stdin from its own task so a child that never reads it cannot
        // block the wait below.
        if let Some(mut stdin) = child.stdin.take() {
            let job_id = job.id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(job_id = %job_id, error = %e, "child closed stdin early");
                }
            });
        }

        let deadline = async {
            match self.config.timeout() {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancellation_token.cancelled() => Outcome::Cancelled,
            limit = deadline => Outcome::TimedOut(limit),
            output = child.wait_with_output() => Outcome::Exited(output),
        };

        match outcome {
            Outcome::Exited(Ok(output)) if output.status.success() => Verdict::Completed,
            Outcome::Exited(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let status = match output.status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "killed by signal".to_string(),
                };
                let tail = tail_chars(stderr.trim(), MAX_ERROR_CHARS);
                if tail.is_empty() {
                    Verdict::Failed(status)
                } else {
                    Verdict::Failed(format!("{status}: {tail}"))
                }
            }
            Outcome::Exited(Err(e)) => Verdict::Failed(format!("wait failed: {e}")),
            Outcome::TimedOut(limit) => {
                Verdict::Failed(format!("TIMEOUT: exceeded {}s", limit.as_secs()))
            }
            // The losing wait future drops the child, which kills it.
            Outcome::Cancelled => Verdict::Abandoned,
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, ctx: ExecutionContext, job: Job) {
        debug!(job_id = %job.id, command = %self.config.command, "spawning executor");
        let result = match self.run_child(&ctx, &job).await {
            Verdict::Completed => {
                info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                ctx.complete(&job.id).await
            }
            Verdict::Failed(reason) => {
                warn!(job_id = %job.id, job_type = %job.job_type, %reason, "job failed");
                ctx.fail(&job.id, &reason).await
            }
            Verdict::Abandoned => {
                info!(job_id = %job.id, job_type = %job.job_type, "child killed on shutdown, job requeued");
                ctx.requeue(&job.id).await
            }
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, code = e.code(), "could not record job outcome");
        }
    }
}

/// Last `max` characters of `s`, prefixed with `...` when cut.
fn tail_chars(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_owned();
    }
    let tail: String = s.chars().skip(total - max).collect();
    format!("...{tail}")
}
