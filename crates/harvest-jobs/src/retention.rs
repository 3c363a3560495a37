//! Retention cleaner: purges expired documents and jobs.
//!
//! A pass is stateless. It takes "now" and the retention config, attempts
//! every category independently, and reports what it removed. Day counts of
//! zero or below keep a category forever. Job types are swept from the
//! configuration and from whatever tags are actually stored, so custom and
//! unroutable types expire under the global default too.

use chrono::{DateTime, Duration, Utc};
use harvest_core::config::RetentionConfig;
use tracing::{debug, info, warn};

use crate::{
    store::JobStore,
    types::{JobType, RetentionStats},
};

/// Job types known from configuration: the built-ins plus every type named
/// in the per-type overrides.
pub fn known_job_types(config: &RetentionConfig) -> Vec<JobType> {
    let mut types: Vec<JobType> = JobType::BUILTIN.to_vec();
    for tag in config.job_types.keys() {
        push_unique(&mut types, JobType::from(tag.as_str()));
    }
    types
}

fn push_unique(types: &mut Vec<JobType>, job_type: JobType) {
    if !types.contains(&job_type) {
        types.push(job_type);
    }
}

/// `now - days`, or `None` when the subtraction would overflow. An
/// unrepresentable cutoff is treated like "keep forever".
fn cutoff(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|ttl| now.checked_sub_signed(ttl))
}

/// Run one retention pass against `store`.
///
/// Never fails: a delete error is logged, counted in
/// [`RetentionStats::failures`], and the remaining categories are still
/// attempted.
pub async fn run_retention(
    store: &dyn JobStore,
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> RetentionStats {
    let mut stats = RetentionStats::default();

    if let Some(cutoff) = config.document_days().and_then(|days| cutoff(now, days)) {
        match store.delete_expired_documents(cutoff).await {
            Ok(n) => stats.documents_deleted = n,
            Err(e) => {
                stats.failures += 1;
                warn!(error = %e, code = e.code(), "document retention failed");
            }
        }
    }

    let mut job_types = known_job_types(config);
    match store.list_job_types().await {
        Ok(stored) => {
            for job_type in stored {
                push_unique(&mut job_types, job_type);
            }
        }
        Err(e) => {
            stats.failures += 1;
            warn!(error = %e, code = e.code(), "listing stored job types failed, sweeping configured types only");
        }
    }

    for job_type in job_types {
        let Some(days) = config.job_days_for(job_type.as_str()) else {
            debug!(%job_type, "retention disabled for job type");
            continue;
        };
        let Some(cutoff) = cutoff(now, days) else {
            continue;
        };
        match store.delete_expired_jobs_by_type(&job_type, cutoff).await {
            Ok(n) => {
                stats.jobs_deleted.insert(job_type.to_string(), n);
            }
            Err(e) => {
                stats.failures += 1;
                warn!(%job_type, error = %e, code = e.code(), "job retention failed");
            }
        }
    }

    if stats.is_empty() {
        debug!(failures = stats.failures, "retention pass removed nothing");
    } else {
        info!(
            documents = stats.documents_deleted,
            jobs = stats.total_jobs_deleted(),
            failures = stats.failures,
            "retention pass complete"
        );
    }
    stats
}
