//! Inbound update ingestion that survives transport outages, handler
//! failures, and rate limiting.
//!
//! Data flow: [`TransportManager`] (push or pull) → [`IngestQueue`]
//! (dedup + priority) → [`Processor`] → [`Dispatch`]. Failures are
//! classified into a [`RecoveryKind`] and remediated by the
//! [`ErrorRecoveryService`]; the [`HealthMonitor`] watches dependencies and
//! escalates to a transport fallback when recovery is exhausted.

pub mod actions;
pub mod classify;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod health;
pub mod history;
pub mod probes;
pub mod processor;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod transport;

pub use {
    classify::{Classification, RecoveryKind, Severity, classify},
    dedup::DedupSet,
    envelope::{Dispatch, Envelope},
    error::{Error, Result},
    health::{HealthMonitor, HealthProbe, HealthReport, Overall, ServiceHealth, ServiceStatus},
    history::{ErrorHistory, ErrorInfo},
    processor::Processor,
    queue::{Enqueued, EnvelopeClassifier, IngestQueue, Priority, QueueStats, QueuedMessage},
    recovery::{ErrorRecoveryService, RecoveryAction, RecoveryStrategies},
    service::{HealthSummary, IngestService, ServiceSummary, StatusReport},
    transport::{
        HttpPushProbe, Inbound, InboundSource, Platform, PullCursor, PushProbe, TransportManager,
        TransportMode, TransportPhase, TransportState,
    },
};
