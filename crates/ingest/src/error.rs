use std::{error::Error as StdError, time::Duration};

use crate::classify::RecoveryKind;

/// Crate-wide result type for ingestion operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy of the ingestion subsystem. None of these are fatal to
/// the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The update id was already accepted once; safe to ignore.
    #[error("duplicate update {id}")]
    Duplicate { id: i64 },

    /// Backpressure: the queue is at capacity and the envelope is not critical.
    #[error("ingest queue full ({depth} pending)")]
    QueueFull { depth: usize },

    /// Dispatch failed and no further attempts will be made.
    #[error("dispatch of update {id} failed after {attempts} attempt(s)")]
    DispatchFailed { id: i64, attempts: u32 },

    /// The requested transport cannot be brought up.
    #[error("transport unavailable: {reason}")]
    TransportUnavailable { reason: String },

    /// A monitored service ran out of recovery attempts.
    #[error("recovery exhausted for service {service}")]
    RecoveryExhausted { service: String },

    /// An adapter error already tagged with the remediation it needs.
    #[error("{source}")]
    Recoverable {
        kind: RecoveryKind,
        retry_after: Option<Duration>,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn transport_unavailable(reason: impl std::fmt::Display) -> Self {
        Self::TransportUnavailable {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn recoverable(kind: RecoveryKind, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Recoverable {
            kind,
            retry_after: None,
            source: Box::new(source),
        }
    }

    /// A rate-limit error carrying the platform's requested wait.
    #[must_use]
    pub fn rate_limited(
        retry_after: Duration,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Recoverable {
            kind: RecoveryKind::RateLimit,
            retry_after: Some(retry_after),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Remediation implied by the variant itself, if any.
    #[must_use]
    pub fn recovery_kind(&self) -> Option<RecoveryKind> {
        match self {
            Self::Recoverable { kind, .. } => Some(*kind),
            Self::TransportUnavailable { .. } => Some(RecoveryKind::Network),
            Self::Duplicate { .. }
            | Self::QueueFull { .. }
            | Self::DispatchFailed { .. }
            | Self::RecoveryExhausted { .. }
            | Self::External { .. } => None,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Recoverable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
