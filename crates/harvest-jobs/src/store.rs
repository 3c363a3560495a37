use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    db,
    error::{JobsError, Result},
    types::{Job, JobStatus, JobType, NewJob},
};

/// Durable job storage consumed by the runner and the retention cleaner.
///
/// Implementations must make [`list_pending_jobs`](JobStore::list_pending_jobs)
/// a claim: two callers, in this process or another, never receive the same
/// job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` pending jobs, highest priority first and oldest
    /// first within a priority. Returned jobs are already `running`.
    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Move a running job to a terminal status. Repeating the current
    /// terminal status is a no-op.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Delete documents created before `cutoff`. Returns the number removed.
    async fn delete_expired_documents(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete jobs of `job_type` created before `cutoff`, together with their
    /// documents. Returns the number of jobs removed.
    async fn delete_expired_jobs_by_type(
        &self,
        job_type: &JobType,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Release a claim whose execution never started, or that was abandoned
    /// on shutdown, putting the job back to `pending`.
    async fn requeue_job(&self, id: &str) -> Result<()>;

    /// Every distinct job type tag currently stored.
    async fn list_job_types(&self) -> Result<Vec<JobType>>;
}

const JOB_COLUMNS: &str = "id, job_type, status, priority, url, input, error,
                           claimed_by, created_at, updated_at, completed_at";

/// SQLite-backed [`JobStore`].
///
/// Wraps one connection in a `Mutex`; every call runs on the blocking pool so
/// the runner's tick loop never stalls on disk I/O. Claims use an immediate
/// transaction, which takes SQLite's write lock up front and so serialises
/// claimers across processes sharing the database file.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    worker_id: String,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, worker_id: impl Into<String>) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            worker_id: worker_id.into(),
        })
    }

    pub fn open(path: impl AsRef<Path>, worker_id: impl Into<String>) -> Result<Self> {
        Self::new(db::open(path)?, worker_id)
    }

    pub fn open_in_memory(worker_id: impl Into<String>) -> Result<Self> {
        Self::new(db::open_in_memory()?, worker_id)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| JobsError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| JobsError::Task(e.to_string()))?
    }

    /// Enqueue a job created now.
    pub async fn insert_job(&self, new: NewJob) -> Result<Job> {
        self.insert_job_at(new, Utc::now()).await
    }

    /// Enqueue a job with an explicit creation time.
    pub async fn insert_job_at(&self, new: NewJob, created_at: DateTime<Utc>) -> Result<Job> {
        let job = Job {
            id: Uuid::now_v7().to_string(),
            job_type: new.job_type,
            status: JobStatus::Pending,
            priority: new.priority,
            url: new.url,
            input: new.input,
            error: None,
            claimed_by: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
        };
        let input = serde_json::to_string(&job.input)?;
        let row = job.clone();

        self.with_conn(move |conn| {
            let ts = fmt_ts(&row.created_at);
            conn.execute(
                "INSERT INTO jobs
                 (id, job_type, status, priority, url, input, error,
                  claimed_by, claimed_at, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?6, NULL)",
                rusqlite::params![
                    row.id,
                    row.job_type.as_str(),
                    row.priority,
                    row.url,
                    input,
                    ts
                ],
            )?;
            Ok(())
        })
        .await?;

        info!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "job enqueued");
        Ok(job)
    }

    /// Store a document created now. Returns its id.
    pub async fn insert_document(
        &self,
        job_id: Option<&str>,
        url: &str,
        content: &str,
    ) -> Result<String> {
        self.insert_document_at(job_id, url, content, Utc::now())
            .await
    }

    /// Store a document with an explicit creation time. Returns its id.
    pub async fn insert_document_at(
        &self,
        job_id: Option<&str>,
        url: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let (doc_id, job_id, url, content) = (
            id.clone(),
            job_id.map(str::to_string),
            url.to_string(),
            content.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (id, job_id, url, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![doc_id, job_id, url, content, fmt_ts(&created_at)],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    [&id],
                    row_to_job,
                )
                .optional()?;
            Ok(job)
        })
        .await
    }

    /// Number of jobs per status. Statuses with no jobs are omitted.
    pub async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
            let counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(counts)
        })
        .await
    }

    pub async fn count_documents(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let worker_id = self.worker_id.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Collect inside the block so `stmt` is dropped before the UPDATEs
            // borrow the transaction again.
            let candidates: Vec<Job> = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'pending'
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map([limit as i64], row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let now = Utc::now();
            let now_str = fmt_ts(&now);
            let mut claimed = Vec::with_capacity(candidates.len());
            for mut job in candidates {
                let n = tx.execute(
                    "UPDATE jobs
                     SET status = 'running', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![worker_id, now_str, job.id],
                )?;
                if n == 1 {
                    job.status = JobStatus::Running;
                    job.claimed_by = Some(worker_id.clone());
                    job.updated_at = now;
                    claimed.push(job);
                }
            }
            tx.commit()?;

            if !claimed.is_empty() {
                debug!(count = claimed.len(), "claimed pending jobs");
            }
            Ok(claimed)
        })
        .await
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let id = id.to_string();
        if !status.is_terminal() {
            return Err(JobsError::InvalidTransition {
                id,
                from: JobStatus::Running,
                to: status,
            });
        }
        // The error column is reserved for failures.
        let error = match status {
            JobStatus::Failed => error.map(str::to_string),
            _ => None,
        };

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row("SELECT status FROM jobs WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()?;
            let current: JobStatus = match current {
                None => return Err(JobsError::JobNotFound { id }),
                Some(s) => s.parse::<JobStatus>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
                })?,
            };

            if current == status {
                debug!(job_id = %id, %status, "status already set");
                return Ok(());
            }
            if current != JobStatus::Running {
                return Err(JobsError::InvalidTransition {
                    id,
                    from: current,
                    to: status,
                });
            }

            let now = fmt_ts(&Utc::now());
            tx.execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3, completed_at = ?3
                 WHERE id = ?4",
                rusqlite::params![status.as_str(), error, now, id],
            )?;
            tx.commit()?;
            debug!(job_id = %id, %status, "job status updated");
            Ok(())
        })
        .await
    }

    async fn delete_expired_documents(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM documents WHERE created_at < ?1",
                [fmt_ts(&cutoff)],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn delete_expired_jobs_by_type(
        &self,
        job_type: &JobType,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let job_type = job_type.as_str().to_string();
        self.with_conn(move |conn| {
            let cutoff = fmt_ts(&cutoff);
            let tx = conn.transaction()?;
            // Explicit cascade: does not rely on the connection having
            // foreign_keys enabled.
            tx.execute(
                "DELETE FROM documents WHERE job_id IN
                   (SELECT id FROM jobs WHERE job_type = ?1 AND created_at < ?2)",
                rusqlite::params![job_type, cutoff],
            )?;
            let n = tx.execute(
                "DELETE FROM jobs WHERE job_type = ?1 AND created_at < ?2",
                rusqlite::params![job_type, cutoff],
            )?;
            tx.commit()?;
            Ok(n as u64)
        })
        .await
    }

    async fn requeue_job(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = fmt_ts(&Utc::now());
            let n = conn.execute(
                "UPDATE jobs
                 SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'running'",
                rusqlite::params![now, id],
            )?;
            if n == 1 {
                debug!(job_id = %id, "job requeued");
                return Ok(());
            }
            let current: Option<String> = conn
                .query_row("SELECT status FROM jobs WHERE id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()?;
            match current {
                None => Err(JobsError::JobNotFound { id }),
                Some(s) => Err(JobsError::InvalidTransition {
                    id,
                    from: s.parse().unwrap_or(JobStatus::Failed),
                    to: JobStatus::Pending,
                }),
            }
        })
        .await
    }

    async fn list_job_types(&self) -> Result<Vec<JobType>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT DISTINCT job_type FROM jobs ORDER BY job_type")?;
            let types = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|tag| tag.map(JobType::from))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(types)
        })
        .await
    }
}

/// Timestamps are stored with fixed microsecond precision and a `Z` suffix so
/// string comparison in SQL matches chronological order.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    // Input is opaque: keep undecodable payloads as a raw string rather than
    // refusing to hand the job out.
    let input: String = row.get(5)?;
    let input = serde_json::from_str(&input).unwrap_or(serde_json::Value::String(input));
    let completed_at: Option<String> = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        job_type: JobType::from(row.get::<_, String>(1)?),
        status,
        priority: row.get(3)?,
        url: row.get(4)?,
        input,
        error: row.get(6)?,
        claimed_by: row.get(7)?,
        created_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        completed_at: completed_at.map(|s| parse_ts(10, &s)).transpose()?,
    })
}
