use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use {
    async_trait::async_trait,
    tracing::{debug, error, info, warn},
};

use crate::{
    classify::{Classification, RecoveryKind, classify},
    history::{ErrorHistory, ErrorInfo},
};

/// A remediation step run when a class of failure is detected.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Registry of one [`RecoveryAction`] per [`RecoveryKind`].
///
/// Actions are registered during startup wiring, after the components they
/// act on exist.
#[derive(Default)]
pub struct RecoveryStrategies {
    actions: RwLock<HashMap<RecoveryKind, Arc<dyn RecoveryAction>>>,
}

impl RecoveryStrategies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: RecoveryKind, action: Arc<dyn RecoveryAction>) {
        info!(kind = %kind, action = action.name(), "registered recovery action");
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, action);
    }

    #[must_use]
    pub fn get(&self, kind: RecoveryKind) -> Option<Arc<dyn RecoveryAction>> {
        self.actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
    }

    /// Run the action for `kind`. Returns `Ok(false)` when none is registered.
    pub async fn run(&self, kind: RecoveryKind) -> anyhow::Result<bool> {
        let Some(action) = self.get(kind) else {
            warn!(kind = %kind, "no recovery action registered");
            return Ok(false);
        };
        info!(kind = %kind, action = action.name(), "running recovery action");
        action.run().await?;
        Ok(true)
    }
}

/// Rate limits and timeouts only need to be waited out.
fn needs_action(kind: RecoveryKind) -> bool {
    !matches!(
        kind,
        RecoveryKind::RateLimit | RecoveryKind::Timeout | RecoveryKind::Unknown
    )
}

/// Classifies failures, keeps the rolling error history, and retries
/// operations with kind-specific waits.
pub struct ErrorRecoveryService {
    strategies: Arc<RecoveryStrategies>,
    history: Arc<ErrorHistory>,
    /// Kinds with a background remediation still running.
    in_flight: Arc<Mutex<HashSet<RecoveryKind>>>,
    max_retries: u32,
    rate_limit_wait: Duration,
    timeout_wait: Duration,
    backoff_cap: Duration,
}

impl ErrorRecoveryService {
    pub fn new(
        config: &courier_config::RecoveryConfig,
        strategies: Arc<RecoveryStrategies>,
        history: Arc<ErrorHistory>,
    ) -> Self {
        Self {
            strategies,
            history,
            in_flight: Arc::default(),
            max_retries: config.max_retries,
            rate_limit_wait: config.rate_limit_wait(),
            timeout_wait: config.timeout_wait(),
            backoff_cap: config.backoff_cap(),
        }
    }

    #[must_use]
    pub fn strategies(&self) -> &Arc<RecoveryStrategies> {
        &self.strategies
    }

    #[must_use]
    pub fn history(&self) -> &Arc<ErrorHistory> {
        &self.history
    }

    /// `min(retry * 2, cap)` seconds.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_secs(u64::from(retry) * 2).min(self.backoff_cap)
    }

    /// How long to wait before the next attempt after a failure of this class.
    #[must_use]
    pub fn wait_for(&self, classification: &Classification, retry: u32) -> Duration {
        match classification.kind {
            RecoveryKind::RateLimit => classification.retry_after.unwrap_or(self.rate_limit_wait),
            RecoveryKind::Timeout => self.timeout_wait,
            RecoveryKind::Unknown => Duration::ZERO,
            _ => self.backoff(retry),
        }
    }

    /// Classify a failed delivery, start the matching remediation in the
    /// background, and return the wait the caller should observe before
    /// trying again.
    ///
    /// At most one remediation per kind runs at a time. Does not record
    /// history; the caller decides what is worth keeping.
    pub fn remediate(&self, err: &anyhow::Error, retry: u32) -> (Classification, Duration) {
        let classification = classify(err);
        self.spawn_strategy(classification.kind);
        (classification, self.wait_for(&classification, retry))
    }

    fn spawn_strategy(&self, kind: RecoveryKind) {
        if !needs_action(kind) {
            return;
        }
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind)
        {
            debug!(kind = %kind, "remediation already running");
            return;
        }
        let strategies = Arc::clone(&self.strategies);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            if let Err(e) = strategies.run(kind).await {
                warn!(kind = %kind, error = %e, "recovery action failed");
            }
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&kind);
        });
    }

    async fn run_strategy(&self, kind: RecoveryKind) {
        if !needs_action(kind) {
            return;
        }
        if let Err(e) = self.strategies.run(kind).await {
            warn!(kind = %kind, error = %e, "recovery action failed");
        }
    }

    /// Run `op`, retrying recoverable failures up to `max_retries` times.
    ///
    /// `unknown` failures are recorded and returned immediately: this layer
    /// has nothing to offer for them.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let classification = classify(&err);
            self.history.record(
                ErrorInfo::new(
                    classification.kind.as_str(),
                    classification.severity,
                    format!("{operation}: {err:#}"),
                )
                .with_retries(retry, self.max_retries)
                .with_strategy(classification.kind),
            );

            if classification.kind == RecoveryKind::Unknown {
                error!(operation, error = %err, "unrecoverable error, not retrying");
                return Err(err);
            }
            if retry >= self.max_retries {
                error!(operation, retries = retry, error = %err, "retries exhausted");
                return Err(err.context(format!("{operation}: retries exhausted")));
            }

            retry += 1;
            self.run_strategy(classification.kind).await;
            let wait = self.wait_for(&classification, retry);
            warn!(
                operation,
                kind = %classification.kind,
                attempt = retry,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "retrying after recoverable error"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
