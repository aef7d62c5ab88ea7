//! Dependency health polling with per-service recovery.
//!
//! Each service moves through
//! `HEALTHY → DEGRADED → FAILED → RECOVERING → HEALTHY`. A service that runs
//! out of recovery attempts stays `FAILED` until the process restarts, and
//! the monitor reports `overall = degraded` instead of bringing the process
//! down.

use std::{
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    classify::RecoveryKind,
    recovery::{RecoveryAction, RecoveryStrategies},
};

/// A liveness check for one dependency. Returning `Err` counts the same as
/// returning `Ok(false)`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Failed,
    Recovering,
}

/// Health record of one monitored dependency. Only the monitor mutates it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_count: u32,
    pub recovery_attempts: u32,
    pub max_failures: u32,
    pub max_recovery_attempts: u32,
    /// Recovery gave up; the service stays failed and is no longer probed.
    pub abandoned: bool,
}

/// What the monitor should do after a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Not failed (yet), nothing to do.
    None,
    /// Start recovery attempt number `n`.
    Attempt(u32),
    /// Attempts are used up; the service is abandoned.
    Abandon,
}

impl ServiceHealth {
    #[must_use]
    pub fn new(name: impl Into<String>, max_failures: u32, max_recovery_attempts: u32) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Healthy,
            last_check: None,
            last_error: None,
            failure_count: 0,
            recovery_attempts: 0,
            max_failures,
            max_recovery_attempts,
            abandoned: false,
        }
    }

    pub fn record_success(&mut self) {
        self.last_check = Some(Utc::now());
        if self.abandoned {
            return;
        }
        if self.status != ServiceStatus::Healthy {
            info!(service = %self.name, from = ?self.status, "service healthy again");
        }
        self.status = ServiceStatus::Healthy;
        self.failure_count = 0;
        self.recovery_attempts = 0;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_check = Some(Utc::now());
        self.last_error = Some(error.into());
        if self.abandoned {
            return;
        }
        self.failure_count += 1;
        let next = match self.status {
            ServiceStatus::Healthy | ServiceStatus::Degraded
                if self.failure_count >= self.max_failures =>
            {
                ServiceStatus::Failed
            },
            ServiceStatus::Healthy => ServiceStatus::Degraded,
            // A failed check during recovery sends the service back to failed.
            ServiceStatus::Recovering => ServiceStatus::Failed,
            other => other,
        };
        if next != self.status {
            warn!(
                service = %self.name,
                from = ?self.status,
                to = ?next,
                failures = self.failure_count,
                error = self.last_error.as_deref().unwrap_or_default(),
                "service health degraded"
            );
        }
        self.status = next;
    }

    /// Decide whether a failed service gets another recovery attempt.
    pub fn begin_recovery(&mut self) -> RecoveryDecision {
        if self.status != ServiceStatus::Failed || self.abandoned {
            return RecoveryDecision::None;
        }
        if self.recovery_attempts >= self.max_recovery_attempts {
            self.abandoned = true;
            return RecoveryDecision::Abandon;
        }
        self.recovery_attempts += 1;
        self.status = ServiceStatus::Recovering;
        RecoveryDecision::Attempt(self.recovery_attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: Overall,
    pub per_service: Vec<ServiceHealth>,
}

struct ServiceSlot {
    kind: RecoveryKind,
    probe: Arc<dyn HealthProbe>,
    health: ServiceHealth,
}

/// Polls registered services and drives their recovery.
pub struct HealthMonitor {
    slots: Mutex<Vec<ServiceSlot>>,
    strategies: Arc<RecoveryStrategies>,
    probe_timeout: Duration,
    interval: Duration,
    max_failures: u32,
    max_recovery_attempts: u32,
    /// Run once a listener or platform service is abandoned.
    fallback: OnceLock<Arc<dyn RecoveryAction>>,
}

impl HealthMonitor {
    pub fn new(config: &courier_config::HealthConfig, strategies: Arc<RecoveryStrategies>) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            strategies,
            probe_timeout: config.probe_timeout(),
            interval: config.interval(),
            max_failures: config.max_failures,
            max_recovery_attempts: config.max_recovery_attempts,
            fallback: OnceLock::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ServiceSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a service. Registering the same name twice replaces the probe.
    pub fn register(&self, name: &str, kind: RecoveryKind, probe: Arc<dyn HealthProbe>) {
        let mut slots = self.lock();
        let health = ServiceHealth::new(name, self.max_failures, self.max_recovery_attempts);
        match slots.iter_mut().find(|s| s.health.name == name) {
            Some(slot) => {
                slot.kind = kind;
                slot.probe = probe;
            },
            None => slots.push(ServiceSlot {
                kind,
                probe,
                health,
            }),
        }
        debug!(service = name, kind = %kind, "health probe registered");
    }

    /// Set the escalation run when a transport-related service is abandoned.
    pub fn set_fallback(&self, action: Arc<dyn RecoveryAction>) {
        if self.fallback.set(action).is_err() {
            warn!("health monitor fallback already set");
        }
    }

    async fn probe(&self, probe: Arc<dyn HealthProbe>) -> Result<(), String> {
        match tokio::time::timeout(self.probe_timeout, probe.check()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("probe reported unhealthy".into()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!(
                "probe timed out after {}s",
                self.probe_timeout.as_secs()
            )),
        }
    }

    /// Probe every service concurrently, update the state machines, and
    /// start recovery for failed services.
    pub async fn check_all(&self) {
        let targets: Vec<(String, Arc<dyn HealthProbe>)> = self
            .lock()
            .iter()
            .filter(|s| !s.health.abandoned)
            .map(|s| (s.health.name.clone(), Arc::clone(&s.probe)))
            .collect();

        let results = futures::future::join_all(
            targets
                .into_iter()
                .map(|(name, probe)| async move { (name, self.probe(probe).await) }),
        )
        .await;

        let mut recoveries = Vec::new();
        let mut abandoned = Vec::new();
        {
            let mut slots = self.lock();
            for (name, outcome) in results {
                let Some(slot) = slots.iter_mut().find(|s| s.health.name == name) else {
                    continue;
                };
                match outcome {
                    Ok(()) => slot.health.record_success(),
                    Err(e) => slot.health.record_failure(e),
                }
                match slot.health.begin_recovery() {
                    RecoveryDecision::None => {},
                    RecoveryDecision::Attempt(n) => recoveries.push((name, slot.kind, n)),
                    RecoveryDecision::Abandon => abandoned.push((name, slot.kind)),
                }
            }
        }

        for (name, kind, attempt) in recoveries {
            info!(service = %name, kind = %kind, attempt, "starting service recovery");
            let strategies = Arc::clone(&self.strategies);
            tokio::spawn(async move {
                match strategies.run(kind).await {
                    Ok(true) => debug!(service = %name, "recovery action completed"),
                    Ok(false) => {},
                    Err(e) => warn!(service = %name, error = %e, "recovery action failed"),
                }
            });
        }

        for (name, kind) in abandoned {
            error!(
                service = %name,
                "recovery attempts exhausted, service stays failed until restart"
            );
            if matches!(kind, RecoveryKind::Listener | RecoveryKind::PlatformApi)
                && let Some(fallback) = self.fallback.get()
            {
                let fallback = Arc::clone(fallback);
                tokio::spawn(async move {
                    if let Err(e) = fallback.run().await {
                        error!(error = %e, "transport fallback failed");
                    }
                });
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> HealthReport {
        let per_service: Vec<ServiceHealth> =
            self.lock().iter().map(|s| s.health.clone()).collect();
        let overall = if per_service
            .iter()
            .all(|s| s.status == ServiceStatus::Healthy)
        {
            Overall::Healthy
        } else {
            Overall::Degraded
        };
        HealthReport {
            overall,
            per_service,
        }
    }

    /// Check every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_all().await,
            }
        }
        info!("health monitor stopped");
    }
}
