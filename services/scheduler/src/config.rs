//! Configuration for the scheduler.
//!
//! Everything is read from `BRIG_*` environment variables with defaults.
//! Credentials have no defaults and must be provided.

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Scheduler process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,

    /// Orchestration API access.
    pub api: ApiConfig,

    /// Message broker access.
    pub amqp: AmqpConfig,

    /// Substrate (Kubernetes) access.
    pub kube: KubeConfig,

    /// Ceilings and intervals for the scheduling loops.
    pub scheduler: SchedulerConfig,
}

/// Orchestration API client settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the API server.
    pub address: String,

    /// Bearer token presented on every request.
    pub token: String,

    /// Accept invalid TLS certificates.
    pub ignore_cert_warnings: bool,
}

/// AMQP 1.0 broker settings.
#[derive(Clone)]
pub struct AmqpConfig {
    /// Broker URL, e.g. `amqp://broker:5672`.
    pub address: String,

    /// SASL PLAIN username.
    pub username: String,

    /// SASL PLAIN password.
    pub password: String,

    /// Use Azure Service Bus session filters for `<queue>.<group>` names.
    pub is_azure_service_bus: bool,

    /// Maximum connection attempts before giving up.
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts.
    pub connect_backoff: Duration,
}

impl std::fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("is_azure_service_bus", &self.is_azure_service_bus)
            .field("connect_attempts", &self.connect_attempts)
            .field("connect_backoff", &self.connect_backoff)
            .finish()
    }
}

/// Kubernetes API access.
///
/// When both fields are `None` the in-cluster service account is used.
#[derive(Debug, Clone, Default)]
pub struct KubeConfig {
    /// Explicit API server URL.
    pub api_url: Option<String>,

    /// Explicit bearer token.
    pub token: Option<String>,
}

/// Ceilings and intervals for the scheduling loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum Worker pods consuming capacity at once.
    pub max_concurrent_workers: usize,

    /// Maximum Job pods consuming capacity at once.
    pub max_concurrent_jobs: usize,

    /// How often each capacity manager offers an admission.
    pub capacity_interval: Duration,

    /// How often the project list is reconciled.
    pub project_sync_interval: Duration,

    /// How long a terminal pod is kept around before deletion.
    pub pod_deletion_delay: Duration,

    /// Upper bound on closing a queue reader.
    pub reader_close_timeout: Duration,

    /// Upper bound on waiting for tasks after cancellation.
    pub shutdown_grace: Duration,

    /// Delay before relisting pods after a watch ends.
    pub watch_restart_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 2,
            max_concurrent_jobs: 2,
            capacity_interval: Duration::from_secs(5),
            project_sync_interval: brig_reconcile::DEFAULT_RECONCILE_INTERVAL,
            pod_deletion_delay: Duration::from_secs(60),
            reader_close_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            watch_restart_backoff: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Reject configurations that would stall or spin the loops.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workers == 0 {
            bail!("max concurrent workers must be at least 1");
        }
        if self.max_concurrent_jobs == 0 {
            bail!("max concurrent jobs must be at least 1");
        }
        for (name, value) in [
            ("capacity interval", self.capacity_interval),
            ("project sync interval", self.project_sync_interval),
            ("reader close timeout", self.reader_close_timeout),
            ("shutdown grace", self.shutdown_grace),
        ] {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let log_level = env.string_or("BRIG_LOG_LEVEL", "info");

        let api = ApiConfig {
            address: env.string_or("BRIG_API_ADDRESS", "http://127.0.0.1:8080"),
            token: env.required("BRIG_API_TOKEN")?,
            ignore_cert_warnings: env.parse_or("BRIG_API_IGNORE_CERT_WARNINGS", false)?,
        };

        let amqp = AmqpConfig {
            address: env.string_or("BRIG_AMQP_ADDRESS", "amqp://127.0.0.1:5672"),
            username: env.required("BRIG_AMQP_USERNAME")?,
            password: env.required("BRIG_AMQP_PASSWORD")?,
            is_azure_service_bus: env.parse_or("BRIG_AMQP_IS_AZURE_SERVICE_BUS", false)?,
            connect_attempts: env.parse_or(
                "BRIG_AMQP_CONNECT_ATTEMPTS",
                brig_reconcile::DEFAULT_MAX_ATTEMPTS,
            )?,
            connect_backoff: Duration::from_secs(env.parse_or(
                "BRIG_AMQP_CONNECT_BACKOFF_SECS",
                brig_reconcile::DEFAULT_BACKOFF.as_secs(),
            )?),
        };

        let kube = KubeConfig {
            api_url: env.optional("BRIG_KUBE_API_URL"),
            token: env.optional("BRIG_KUBE_TOKEN"),
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_concurrent_workers: env
                .parse_or("BRIG_MAX_CONCURRENT_WORKERS", defaults.max_concurrent_workers)?,
            max_concurrent_jobs: env
                .parse_or("BRIG_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            capacity_interval: env
                .secs_or("BRIG_CAPACITY_INTERVAL_SECS", defaults.capacity_interval)?,
            project_sync_interval: env
                .secs_or("BRIG_PROJECT_SYNC_INTERVAL_SECS", defaults.project_sync_interval)?,
            pod_deletion_delay: env
                .secs_or("BRIG_POD_DELETION_DELAY_SECS", defaults.pod_deletion_delay)?,
            reader_close_timeout: env
                .secs_or("BRIG_READER_CLOSE_TIMEOUT_SECS", defaults.reader_close_timeout)?,
            shutdown_grace: env.secs_or("BRIG_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            watch_restart_backoff: defaults.watch_restart_backoff,
        };
        scheduler.validate()?;

        Ok(Self {
            log_level,
            api,
            amqp,
            kube,
            scheduler,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("{key} must be set"))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for {key}: {e}")),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse_or(key, default.as_secs()).map(Duration::from_secs)
    }
}
