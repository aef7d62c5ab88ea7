use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub server: ServerConfig,
    pub telegram: TelegramConfig,
    pub queue: QueueConfig,
    pub transport: TransportConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub dispatch: DispatchConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    /// Port to listen on. Defaults to 8443.
    pub port: u16,
    /// Path the platform POSTs updates to while in push mode.
    pub webhook_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8443,
            webhook_path: "/webhook".into(),
        }
    }
}

/// Telegram bot account configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// Public URL the platform should call in push mode. When unset the
    /// transport always runs in pull mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    /// Long-poll timeout passed to `getUpdates`, in seconds.
    pub poll_timeout_secs: u64,

    /// Commands that bypass the queue when it is full (e.g. "/start").
    pub critical_commands: Vec<String>,

    /// Commands routed with the highest queue priority.
    pub admin_commands: Vec<String>,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("token", &"[REDACTED]")
            .field("push_url", &self.push_url)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            push_url: None,
            poll_timeout_secs: 30,
            critical_commands: vec!["/start".into(), "/help".into(), "/emergency".into()],
            admin_commands: vec!["/admin".into(), "/stop".into(), "/status".into()],
        }
    }
}

impl TelegramConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Ingest queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue length at which non-critical envelopes are rejected.
    pub max_size: usize,
    /// Delivery attempts before a message is dropped.
    pub max_retries: u32,
    /// Upper bound of remembered update ids.
    pub dedup_capacity: usize,
    /// Ids kept (most recent first) when the dedup set overflows.
    pub dedup_retain: usize,
    /// Messages older than this when popped are discarded.
    pub message_ttl_secs: u64,
    /// Pause after a failed dispatch before the next pop.
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_retries: 3,
            dedup_capacity: 1000,
            dedup_retain: 500,
            message_ttl_secs: 300,
            retry_delay_ms: 1000,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Push/pull transport behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout of the push endpoint reachability probe.
    pub push_probe_timeout_secs: u64,
    /// How often the push endpoint is probed while in push mode.
    pub push_check_interval_secs: u64,
    /// Consecutive failed push probes before falling back to pull.
    pub push_failure_threshold: u32,
    /// Consecutive pull errors before trying push.
    pub pull_error_threshold: u32,
    /// Ceiling of the pull loop's exponential backoff.
    pub pull_backoff_max_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            push_probe_timeout_secs: 10,
            push_check_interval_secs: 60,
            push_failure_threshold: 3,
            pull_error_threshold: 3,
            pull_backoff_max_secs: 30,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn push_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.push_probe_timeout_secs)
    }

    #[must_use]
    pub fn push_check_interval(&self) -> Duration {
        Duration::from_secs(self.push_check_interval_secs)
    }

    #[must_use]
    pub fn pull_backoff_max(&self) -> Duration {
        Duration::from_secs(self.pull_backoff_max_secs)
    }
}

/// Which remediation applies when an HTTP-probed service fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Datastore,
    PlatformApi,
    #[default]
    ExternalApi,
    Network,
    Listener,
}

/// A dependency checked with a plain HTTP GET.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProbeConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: ProbeKind,
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between `check_all` rounds.
    pub interval_secs: u64,
    /// Per-probe timeout.
    pub probe_timeout_secs: u64,
    /// Failed checks before a service is marked failed.
    pub max_failures: u32,
    /// Recovery runs before a service is abandoned.
    pub max_recovery_attempts: u32,
    /// Free disk space below which the disk probe fails.
    pub min_free_disk_mb: u64,
    /// Available memory below which the memory probe fails.
    pub min_free_memory_mb: u64,
    /// Extra HTTP-probed dependencies (datastore, AI provider, ...).
    pub services: Vec<ServiceProbeConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            probe_timeout_secs: 5,
            max_failures: 3,
            max_recovery_attempts: 3,
            min_free_disk_mb: 512,
            min_free_memory_mb: 128,
            services: Vec::new(),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Error recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts made by `ErrorRecoveryService::execute` before giving up.
    pub max_retries: u32,
    /// Wait applied to rate-limit errors without a retry-after hint.
    pub rate_limit_wait_secs: u64,
    /// Wait applied to timeouts.
    pub timeout_wait_secs: u64,
    /// Ceiling of the `retry * 2` second backoff.
    pub backoff_cap_secs: u64,
    /// Entries kept in the rolling error history.
    pub history_capacity: usize,
    /// Directory whose stale files may be deleted to free disk space.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<std::path::PathBuf>,
    /// Age after which scratch files count as stale.
    pub scratch_max_age_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rate_limit_wait_secs: 60,
            timeout_wait_secs: 5,
            backoff_cap_secs: 10,
            history_capacity: 100,
            scratch_dir: None,
            scratch_max_age_secs: 3600,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }

    #[must_use]
    pub fn timeout_wait(&self) -> Duration {
        Duration::from_secs(self.timeout_wait_secs)
    }

    #[must_use]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

/// Where decoded envelopes are handed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Application endpoint receiving each envelope as JSON. When unset,
    /// envelopes are only logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            forward_url: None,
            timeout_secs: 30,
        }
    }
}
