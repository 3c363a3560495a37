use std::collections::BTreeMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Scheduler tunables. Non-positive configured values fall back to these.
pub const DEFAULT_POLL_INTERVAL_MS: i64 = 2_000;
pub const DEFAULT_MAX_CONCURRENT_JOBS: i64 = 4;
pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: i64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Top-level config (harvest.toml + HARVEST_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Executor definitions keyed by job type tag, e.g. `[executors.scrape]`.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Polling loop and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Delay between ticks in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: i64,
    /// Upper bound on executions running at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: i64,
    /// How long `run` waits for in-flight executions after cancellation.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Claim token written to `jobs.claimed_by`. Unique per process by default.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            worker_id: default_worker_id(),
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        let ms = positive_or(self.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        Duration::from_millis(ms as u64)
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        positive_or(self.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS) as usize
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Retention policy for jobs and their auxiliary documents.
///
/// Day counts of zero or below mean "keep forever" for that category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: i64,
    /// TTL for documents, in days.
    #[serde(default = "default_retention_days")]
    pub document_default_days: i64,
    /// TTL for jobs whose type has no positive override, in days.
    #[serde(default = "default_retention_days")]
    pub job_default_days: i64,
    /// Per-type TTL overrides, e.g. `[retention.job_types] scrape = 5`.
    #[serde(default)]
    pub job_types: BTreeMap<String, i64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval_minutes: default_cleanup_interval_minutes(),
            document_default_days: default_retention_days(),
            job_default_days: default_retention_days(),
            job_types: BTreeMap::new(),
        }
    }
}

impl RetentionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        let minutes = positive_or(
            self.cleanup_interval_minutes,
            DEFAULT_CLEANUP_INTERVAL_MINUTES,
        );
        let secs = (minutes as u64)
            .checked_mul(60)
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL_MINUTES as u64 * 60);
        Duration::from_secs(secs)
    }

    /// Resolve the TTL for one job type: the override when positive, else the
    /// global default. `None` means the type is never purged.
    pub fn job_days_for(&self, job_type: &str) -> Option<i64> {
        match self.job_types.get(job_type) {
            Some(&days) if days > 0 => Some(days),
            _ if self.job_default_days > 0 => Some(self.job_default_days),
            _ => None,
        }
    }

    /// Document TTL in days, `None` when disabled.
    pub fn document_days(&self) -> Option<i64> {
        (self.document_default_days > 0).then_some(self.document_default_days)
    }
}

/// An external program that executes every job of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Wall-clock limit per job. 0 disables the limit.
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn positive_or(value: i64, fallback: i64) -> i64 {
    if value > 0 {
        value
    } else {
        fallback
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_ms() -> i64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_concurrent_jobs() -> i64 {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_cleanup_interval_minutes() -> i64 {
    DEFAULT_CLEANUP_INTERVAL_MINUTES
}
fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}
fn default_executor_timeout_secs() -> u64 {
    DEFAULT_EXECUTOR_TIMEOUT_SECS
}
fn default_worker_id() -> String {
    format!("worker-{}", Uuid::now_v7())
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvest/harvest.db", home)
}

impl HarvestConfig {
    /// Load config from a TOML file with HARVEST_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `HARVEST_RUNNER__MAX_CONCURRENT_JOBS=8`. A missing file is not an
    /// error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HarvestConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HARVEST_").split("__"))
            .extract()
            .map_err(|e| crate::error::HarvestError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject executor entries that can never run.
    pub fn validate(&self) -> crate::error::Result<()> {
        for (job_type, executor) in &self.executors {
            if executor.command.trim().is_empty() {
                return Err(crate::error::HarvestError::InvalidExecutor {
                    job_type: job_type.clone(),
                    reason: "command is empty".into(),
                });
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvest/harvest.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = HarvestConfig::default();
        assert_eq!(config.runner.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.runner.max_concurrent_jobs(), 4);
        assert_eq!(config.retention.cleanup_interval(), Duration::from_secs(3600));
        assert!(config.retention.enabled);
        assert!(config.runner.worker_id.starts_with("worker-"));
    }

    #[test]
    fn non_positive_tunables_fall_back_to_defaults() {
        let runner = RunnerConfig {
            poll_interval_ms: 0,
            max_concurrent_jobs: -3,
            ..RunnerConfig::default()
        };
        assert_eq!(runner.poll_interval(), Duration::from_millis(2_000));
        assert_eq!(runner.max_concurrent_jobs(), 4);

        let retention = RetentionConfig {
            cleanup_interval_minutes: -1,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.cleanup_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn oversized_cleanup_interval_falls_back_instead_of_overflowing() {
        let retention = RetentionConfig {
            cleanup_interval_minutes: i64::MAX,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.cleanup_interval(), Duration::from_secs(3600));

        let retention = RetentionConfig {
            cleanup_interval_minutes: 1_440,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.cleanup_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn job_ttl_prefers_positive_override() {
        let mut retention = RetentionConfig {
            job_default_days: 30,
            ..RetentionConfig::default()
        };
        retention.job_types.insert("scrape".into(), 5);
        retention.job_types.insert("crawl".into(), 0);

        assert_eq!(retention.job_days_for("scrape"), Some(5));
        // Zero override falls back to the global default.
        assert_eq!(retention.job_days_for("crawl"), Some(30));
        assert_eq!(retention.job_days_for("map"), Some(30));
    }

    #[test]
    fn job_ttl_disabled_without_override_or_default() {
        let mut retention = RetentionConfig {
            job_default_days: 0,
            ..RetentionConfig::default()
        };
        retention.job_types.insert("scrape".into(), 7);

        assert_eq!(retention.job_days_for("scrape"), Some(7));
        assert_eq!(retention.job_days_for("crawl"), None);
    }

    #[test]
    fn zero_document_days_means_disabled() {
        let retention = RetentionConfig {
            document_default_days: 0,
            ..RetentionConfig::default()
        };
        assert_eq!(retention.document_days(), None);
    }

    #[test]
    fn empty_executor_command_is_rejected() {
        let mut config = HarvestConfig::default();
        assert!(config.validate().is_ok());

        config.executors.insert(
            "scrape".into(),
            ExecutorConfig {
                command: "  ".into(),
                args: Vec::new(),
                timeout_secs: 0,
            },
        );
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_EXECUTOR");
        assert!(err.to_string().contains("'scrape'"));
    }

    #[test]
    fn load_reads_toml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/harvest-test.db"

[runner]
poll_interval_ms = 500
max_concurrent_jobs = 8
worker_id = "node-a"

[retention]
enabled = false
document_default_days = 0

[retention.job_types]
scrape = 5

[executors.scrape]
command = "/usr/local/bin/scrape"
args = ["--json"]
timeout_secs = 0
"#
        )
        .unwrap();

        let config = HarvestConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.database.path, "/tmp/harvest-test.db");
        assert_eq!(config.runner.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.runner.max_concurrent_jobs(), 8);
        assert_eq!(config.runner.worker_id, "node-a");
        assert!(!config.retention.enabled);
        assert_eq!(config.retention.document_days(), None);
        assert_eq!(config.retention.job_days_for("scrape"), Some(5));

        let scrape = &config.executors["scrape"];
        assert_eq!(scrape.command, "/usr/local/bin/scrape");
        assert_eq!(scrape.args, vec!["--json".to_string()]);
        assert_eq!(scrape.timeout(), None);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = HarvestConfig::load(path.to_str()).unwrap();
        assert_eq!(config.runner.max_concurrent_jobs(), 4);
        assert!(config.executors.is_empty());
    }
}
