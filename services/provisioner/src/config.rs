//! Configuration for the provisioner daemon.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use mansion_throttle::BackoffPolicy;
use url::Url;

use crate::controller::ProvisionerConfig;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller settings (data dir, timings, caps).
    pub provisioner: ProvisionerConfig,

    /// JSON template catalog.
    pub templates_file: PathBuf,

    /// Base URL of the VM broker.
    pub broker_url: Url,

    /// Public key installed for the worker account; sshd is not configured without it.
    pub ssh_public_key: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir =
            PathBuf::from(var("MANSION_DATA_DIR").unwrap_or_else(|| "/var/lib/mansion".into()));
        let templates_file = var("MANSION_TEMPLATES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("templates.json"));

        let broker_url = var("MANSION_BROKER_URL")
            .unwrap_or_else(|| "https://mansion.local/".to_string());
        let broker_url = Url::parse(&broker_url)
            .with_context(|| format!("MANSION_BROKER_URL is not a valid URL: {broker_url}"))?;

        let ssh_public_key = var("MANSION_SSH_PUBLIC_KEY");
        let log_level = var("MANSION_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let secs = |name: &str, default: u64| -> Result<Duration> {
            parse_or(&var, name, default).map(Duration::from_secs)
        };
        let millis = |name: &str, default: u64| -> Result<Duration> {
            parse_or(&var, name, default).map(Duration::from_millis)
        };

        let mut provisioner = ProvisionerConfig::new(data_dir);
        provisioner.backoff = BackoffPolicy {
            first: secs("MANSION_BACKOFF_FIRST_SECS", 2)?,
            max: secs("MANSION_BACKOFF_MAX_SECS", 600)?,
        };
        provisioner.lease.period = secs("MANSION_LEASE_PERIOD_SECS", 30)?;
        provisioner.lease.stale_after = secs("MANSION_LEASE_STALE_SECS", 30 * 60)?;
        provisioner.retention.idle_timeout = millis("MANSION_IDLE_TIMEOUT_MS", 5000)?;
        provisioner.retention.connect_grace = secs("MANSION_CONNECT_GRACE_SECS", 120)?;
        provisioner.retention.recheck_delay = millis("MANSION_EVICTION_RECHECK_MS", 2000)?;
        provisioner.retention.interval = secs("MANSION_RETENTION_INTERVAL_SECS", 60)?;
        provisioner.registry.problem_retention =
            secs("MANSION_PROBLEM_RETENTION_SECS", 4 * 60 * 60)?;
        provisioner.registry.failure_cap = parse_or(&var, "MANSION_FAILURE_CAP", 8)?;
        provisioner.connect.attempts = parse_or(&var, "MANSION_CONNECT_ATTEMPTS", 10)?;
        provisioner.connect.retry_delay = millis("MANSION_CONNECT_RETRY_MS", 1000)?;
        provisioner.quota_sweep = secs("MANSION_QUOTA_SWEEP_SECS", 5 * 60)?;

        if provisioner.connect.attempts == 0 {
            anyhow::bail!("MANSION_CONNECT_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            provisioner,
            templates_file,
            broker_url,
            ssh_public_key,
            log_level,
        })
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}
