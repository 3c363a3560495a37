use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mid-point of the 0..=100 priority scale. Higher values are claimed first.
pub const DEFAULT_PRIORITY: i64 = 50;

/// Tag selecting which executor runs a job.
///
/// The built-in variants cover the crawl pipeline; anything else read from the
/// store is kept verbatim in `Custom` so an unregistered tag can still be
/// reported back as `UNKNOWN_JOB_TYPE: <tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    Crawl,
    Scrape,
    Map,
    Extract,
    BatchScrape,
    Custom(String),
}

impl JobType {
    pub const BUILTIN: [JobType; 5] = [
        JobType::Crawl,
        JobType::Scrape,
        JobType::Map,
        JobType::Extract,
        JobType::BatchScrape,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            JobType::Crawl => "crawl",
            JobType::Scrape => "scrape",
            JobType::Map => "map",
            JobType::Extract => "extract",
            JobType::BatchScrape => "batch_scrape",
            JobType::Custom(tag) => tag,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, JobType::Custom(_))
    }

    /// Whether the tag is non-empty and uses only `[a-z0-9_-]`.
    pub fn is_well_formed(&self) -> bool {
        let tag = self.as_str();
        !tag.is_empty()
            && tag
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(tag: &str) -> Self {
        match tag {
            "crawl" => JobType::Crawl,
            "scrape" => JobType::Scrape,
            "map" => JobType::Map,
            "extract" => JobType::Extract,
            "batch_scrape" => JobType::BatchScrape,
            other => JobType::Custom(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(tag: String) -> Self {
        match JobType::from(tag.as_str()) {
            JobType::Custom(_) => JobType::Custom(tag),
            builtin => builtin,
        }
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        match job_type {
            JobType::Custom(tag) => tag,
            builtin => builtin.as_str().to_string(),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a runner; an executor owns it.
    Running,
    /// Executor reported success.
    Completed,
    /// Executor reported failure, or no executor exists for the type.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v7 string — primary key, time-sortable.
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    /// Target URL handed to the executor untouched.
    pub url: String,
    /// Arbitrary JSON payload handed to the executor untouched.
    pub input: serde_json::Value,
    /// Failure reason, only set when `status` is `Failed`.
    pub error: Option<String>,
    /// Worker id that claimed the job, if any.
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on the transition to a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub url: String,
    pub input: serde_json::Value,
    pub priority: i64,
}

impl NewJob {
    pub fn new(job_type: impl Into<JobType>, url: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            url: url.into(),
            input: serde_json::Value::Null,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }
}

/// Result of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStats {
    pub documents_deleted: u64,
    /// Jobs deleted per job type tag. Types that were swept but had nothing to
    /// delete are recorded with a zero count.
    pub jobs_deleted: BTreeMap<String, u64>,
    /// Number of delete categories that failed this pass.
    pub failures: u32,
}

impl RetentionStats {
    pub fn total_jobs_deleted(&self) -> u64 {
        self.jobs_deleted.values().sum()
    }

    /// True when the pass removed nothing at all.
    pub fn is_empty(&self) -> bool {
        self.documents_deleted == 0 && self.total_jobs_deleted() == 0
    }
}
