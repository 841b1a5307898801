use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which halves of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// HTTP API and worker pool in one process.
    All,
    Api,
    Worker,
}

impl ProcessRole {
    pub fn runs_api(self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Worker)
    }
}

impl FromStr for ProcessRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(ProcessRole::All),
            "api" => Ok(ProcessRole::Api),
            "worker" => Ok(ProcessRole::Worker),
            other => bail!("PROCESS_ROLE must be one of all|api|worker, got '{other}'"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub anthropic_api_url: String,
    pub port: u16,
    pub rust_log: String,
    pub role: ProcessRole,

    pub worker_concurrency: usize,
    pub knowledge_base_dir: PathBuf,
    pub retrieval_top_k: usize,

    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub recovery_delay: Duration,
    pub task_lease: Duration,
    pub queue_poll_interval: Duration,
    pub failed_retention: Duration,

    pub remote_call_timeout: Duration,
    pub request_timeout: Duration,
    pub record_ttl: Duration,
    pub max_upload_bytes: usize,

    pub upload_rate_limit: u32,
    pub evaluate_rate_limit: u32,
    pub rate_limit_window: Duration,
    pub trust_forwarded_for: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let config = Config {
            redis_url: require_env("REDIS_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            anthropic_api_url: std::env::var("ANTHROPIC_API_URL")
                .unwrap_or_else(|_| crate::llm_client::ANTHROPIC_API_URL.to_string()),
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            role: env_or("PROCESS_ROLE", ProcessRole::All)?,

            worker_concurrency: env_or("WORKER_CONCURRENCY", 2usize)?.max(1),
            knowledge_base_dir: std::env::var("KNOWLEDGE_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./docs")),
            retrieval_top_k: env_or("RETRIEVAL_TOP_K", 3usize)?.max(1),

            max_attempts: env_or("MAX_ATTEMPTS", 3u32)?.max(1),
            backoff_base: Duration::from_millis(env_or("BACKOFF_BASE_MS", 5_000)?),
            recovery_delay: Duration::from_secs(env_or("RECOVERY_DELAY_SECS", 5)?),
            task_lease: Duration::from_secs(env_or("TASK_LEASE_SECS", 600)?),
            queue_poll_interval: Duration::from_millis(env_or("QUEUE_POLL_INTERVAL_MS", 1_000)?),
            failed_retention: Duration::from_secs(env_or("FAILED_RETENTION_SECS", 7 * 24 * 3600)?),

            remote_call_timeout: Duration::from_secs(env_or("REMOTE_CALL_TIMEOUT_SECS", 60)?),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 10)?),
            record_ttl: Duration::from_secs(env_or("RECORD_TTL_SECS", 24 * 3600)?),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,

            upload_rate_limit: env_or("UPLOAD_RATE_LIMIT", 10)?,
            evaluate_rate_limit: env_or("EVALUATE_RATE_LIMIT", 20)?,
            rate_limit_window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", 15 * 60)?),
            trust_forwarded_for: env_or("TRUST_FORWARDED_FOR", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects task leases shorter than one remote call or three
    /// maintenance ticks.
    pub fn validate(&self) -> Result<()> {
        if self.task_lease <= self.remote_call_timeout {
            bail!(
                "TASK_LEASE_SECS ({}s) must exceed REMOTE_CALL_TIMEOUT_SECS ({}s)",
                self.task_lease.as_secs(),
                self.remote_call_timeout.as_secs()
            );
        }
        if self.task_lease < self.queue_poll_interval * 3 {
            bail!(
                "TASK_LEASE_SECS ({}s) must be at least three queue poll intervals",
                self.task_lease.as_secs()
            );
        }
        Ok(())
    }

    /// Body limit for `/upload`: two files at the ceiling plus multipart framing.
    pub fn upload_body_limit(&self) -> usize {
        self.max_upload_bytes * 2 + 64 * 1024
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} is malformed ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults matching production, with dummy credentials.
    pub fn for_tests() -> Self {
        Config {
            redis_url: "redis://127.0.0.1/".to_string(),
            s3_bucket: "uploads".to_string(),
            s3_endpoint: "http://127.0.0.1:9000".to_string(),
            aws_access_key_id: "test".to_string(),
            aws_secret_access_key: "test".to_string(),
            anthropic_api_key: "test".to_string(),
            anthropic_api_url: crate::llm_client::ANTHROPIC_API_URL.to_string(),
            port: 0,
            rust_log: "debug".to_string(),
            role: ProcessRole::All,
            worker_concurrency: 1,
            knowledge_base_dir: PathBuf::from("./docs"),
            retrieval_top_k: 3,
            max_attempts: 3,
            backoff_base: Duration::from_millis(5_000),
            recovery_delay: Duration::from_secs(5),
            task_lease: Duration::from_secs(600),
            queue_poll_interval: Duration::from_millis(10),
            failed_retention: Duration::from_secs(7 * 24 * 3600),
            remote_call_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            record_ttl: Duration::from_secs(24 * 3600),
            max_upload_bytes: 10 * 1024 * 1024,
            upload_rate_limit: 10,
            evaluate_rate_limit: 20,
            rate_limit_window: Duration::from_secs(15 * 60),
            trust_forwarded_for: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_role_parses_case_insensitively() {
        assert_eq!("Worker".parse::<ProcessRole>().unwrap(), ProcessRole::Worker);
        assert_eq!(" api ".parse::<ProcessRole>().unwrap(), ProcessRole::Api);
        assert!("scheduler".parse::<ProcessRole>().is_err());
    }

    #[test]
    fn test_role_halves() {
        assert!(ProcessRole::All.runs_api() && ProcessRole::All.runs_workers());
        assert!(!ProcessRole::Api.runs_workers());
        assert!(!ProcessRole::Worker.runs_api());
    }

    #[test]
    fn test_lease_must_outlast_a_remote_call() {
        assert!(Config::for_tests().validate().is_ok());

        let short = Config {
            task_lease: Duration::from_secs(60),
            remote_call_timeout: Duration::from_secs(60),
            ..Config::for_tests()
        };
        let err = short.validate().unwrap_err().to_string();
        assert!(err.contains("TASK_LEASE_SECS"), "{err}");
    }

    #[test]
    fn test_lease_must_cover_maintenance_ticks() {
        let config = Config {
            task_lease: Duration::from_secs(2),
            remote_call_timeout: Duration::from_secs(1),
            queue_poll_interval: Duration::from_secs(1),
            ..Config::for_tests()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_body_limit_covers_two_files() {
        let config = Config::for_tests();
        assert!(config.upload_body_limit() > 2 * config.max_upload_bytes);
    }
}
