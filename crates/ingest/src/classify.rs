//! Maps arbitrary errors to the remediation they need.
//!
//! Structured error types are matched first by walking the `anyhow` chain.
//! Message heuristics only apply to third-party errors that carry no type
//! information we can inspect.

use std::{fmt, io, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Class of failure, each with its own remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryKind {
    Datastore,
    PlatformApi,
    ExternalApi,
    RateLimit,
    Timeout,
    Network,
    Memory,
    DiskSpace,
    Listener,
    Unknown,
}

impl RecoveryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datastore => "datastore",
            Self::PlatformApi => "platformApi",
            Self::ExternalApi => "externalApi",
            Self::RateLimit => "rateLimit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Memory => "memory",
            Self::DiskSpace => "diskSpace",
            Self::Listener => "listener",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::RateLimit => Severity::Low,
            Self::ExternalApi | Self::Timeout | Self::Network | Self::Unknown => Severity::Medium,
            Self::Datastore | Self::PlatformApi | Self::Listener => Severity::High,
            Self::Memory | Self::DiskSpace => Severity::Critical,
        }
    }
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<courier_config::ProbeKind> for RecoveryKind {
    fn from(kind: courier_config::ProbeKind) -> Self {
        use courier_config::ProbeKind;
        match kind {
            ProbeKind::Datastore => Self::Datastore,
            ProbeKind::PlatformApi => Self::PlatformApi,
            ProbeKind::ExternalApi => Self::ExternalApi,
            ProbeKind::Network => Self::Network,
            ProbeKind::Listener => Self::Listener,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: RecoveryKind,
    pub severity: Severity,
    /// Wait requested by the remote side (rate limits only).
    pub retry_after: Option<Duration>,
}

impl Classification {
    #[must_use]
    pub fn new(kind: RecoveryKind) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            retry_after: None,
        }
    }
}

/// Classify an error by walking its source chain.
#[must_use]
pub fn classify(err: &anyhow::Error) -> Classification {
    for cause in err.chain() {
        if let Some(found) = classify_structured(cause) {
            return found;
        }
    }
    Classification::new(classify_message(&format!("{err:#}")))
}

fn classify_structured(cause: &(dyn std::error::Error + 'static)) -> Option<Classification> {
    if let Some(e) = cause.downcast_ref::<Error>() {
        return e.recovery_kind().map(|kind| Classification {
            retry_after: e.retry_after(),
            ..Classification::new(kind)
        });
    }
    if let Some(e) = cause.downcast_ref::<io::Error>() {
        return io_kind(e).map(Classification::new);
    }
    if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
        return reqwest_kind(e).map(Classification::new);
    }
    if cause.is::<tokio::time::error::Elapsed>() {
        return Some(Classification::new(RecoveryKind::Timeout));
    }
    None
}

fn io_kind(e: &io::Error) -> Option<RecoveryKind> {
    use io::ErrorKind::*;
    match e.kind() {
        TimedOut | WouldBlock => Some(RecoveryKind::Timeout),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | AddrNotAvailable | HostUnreachable | NetworkUnreachable => Some(RecoveryKind::Network),
        AddrInUse => Some(RecoveryKind::Listener),
        OutOfMemory => Some(RecoveryKind::Memory),
        StorageFull => Some(RecoveryKind::DiskSpace),
        _ => None,
    }
}

fn reqwest_kind(e: &reqwest::Error) -> Option<RecoveryKind> {
    if e.is_timeout() {
        return Some(RecoveryKind::Timeout);
    }
    if e.is_connect() {
        return Some(RecoveryKind::Network);
    }
    // Platform client errors are tagged upstream; a bare status is a peer's.
    match e.status()? {
        reqwest::StatusCode::TOO_MANY_REQUESTS => Some(RecoveryKind::RateLimit),
        _ => Some(RecoveryKind::ExternalApi),
    }
}

/// Ordered substring rules; the first match wins.
const MESSAGE_RULES: &[(&[&str], RecoveryKind)] = &[
    (
        &["rate limit", "too many requests", "429", "flood", "retry after"],
        RecoveryKind::RateLimit,
    ),
    (&["timed out", "timeout", "deadline exceeded"], RecoveryKind::Timeout),
    (
        &["out of memory", "memory allocation", "cannot allocate"],
        RecoveryKind::Memory,
    ),
    (&["no space left", "disk full", "disk quota"], RecoveryKind::DiskSpace),
    (
        &["database", "datastore", "sqlite", "connection pool", "sql"],
        RecoveryKind::Datastore,
    ),
    (
        &["address already in use", "listener", "failed to bind"],
        RecoveryKind::Listener,
    ),
    (
        &["telegram", "bot api", "webhook", "getupdates", "unauthorized"],
        RecoveryKind::PlatformApi,
    ),
    (
        &["openai", "anthropic", "provider", "bad gateway", "service unavailable"],
        RecoveryKind::ExternalApi,
    ),
    (
        &["connection", "network", "dns", "unreachable", "reset by peer", "broken pipe"],
        RecoveryKind::Network,
    ),
];

/// Heuristic fallback for errors without structured type information.
#[must_use]
pub fn classify_message(message: &str) -> RecoveryKind {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map_or(RecoveryKind::Unknown, |(_, kind)| *kind)
}
