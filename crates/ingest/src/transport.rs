//! Push/pull transport management with automatic failover.
//!
//! Exactly one transport is active at a time. Push mode relies on the
//! platform calling our webhook; pull mode runs a long-poll loop. Loops are
//! told about mode changes through a `watch` channel.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::{sync::watch, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    classify::{RecoveryKind, classify},
    envelope::Envelope,
    error::{Error, Result},
    history::ErrorInfo,
    queue::{Enqueued, IngestQueue},
    recovery::ErrorRecoveryService,
};

const INITIAL_PULL_BACKOFF: Duration = Duration::from_secs(1);

/// The messaging platform as seen by the transport layer.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Long-poll for updates with id `>= offset`.
    async fn fetch_updates(&self, offset: i64, timeout: Duration) -> anyhow::Result<Vec<Envelope>>;

    /// Ask the platform to push updates to `url`.
    async fn register_webhook(&self, url: &str) -> anyhow::Result<()>;

    /// Stop push delivery so long polling can work.
    async fn remove_webhook(&self) -> anyhow::Result<()>;

    /// Drop and rebuild any client-side connection state.
    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reachability check for the public push endpoint.
#[async_trait]
pub trait PushProbe: Send + Sync {
    async fn reachable(&self, url: &str) -> bool;
}

/// Bounded-timeout GET against the push URL. Any answer below 500 means a
/// server is listening (a webhook route usually refuses GET).
pub struct HttpPushProbe {
    client: reqwest::Client,
}

impl HttpPushProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl PushProbe for HttpPushProbe {
    async fn reachable(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(url, error = %e, "push endpoint probe failed");
                false
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportMode {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of the transport singleton.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    pub mode: TransportMode,
    pub phase: TransportPhase,
    pub running: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub mode_switches: u64,
    /// Emergency fallback was taken; push will not be tried again.
    pub emergency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSource {
    Push,
    Pull,
}

/// What happened to an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Accepted,
    Duplicate,
    DispatchedInline,
    /// Backpressure: the push path answers 503, the pull path drops it.
    Rejected,
}

/// Long-poll bookkeeping carried between [`TransportManager::poll_once`] calls.
#[derive(Debug, Clone)]
pub struct PullCursor {
    pub offset: i64,
    pub consecutive_errors: u32,
    backoff: Duration,
}

impl Default for PullCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            consecutive_errors: 0,
            backoff: INITIAL_PULL_BACKOFF,
        }
    }
}

struct StateInner {
    mode: TransportMode,
    phase: TransportPhase,
    last_activity: Option<DateTime<Utc>>,
    mode_switches: u64,
    emergency: bool,
}

pub struct TransportManager {
    platform: Arc<dyn Platform>,
    push_probe: Arc<dyn PushProbe>,
    queue: Arc<IngestQueue>,
    recovery: Arc<ErrorRecoveryService>,
    push_url: Option<String>,
    poll_timeout: Duration,
    push_check_interval: Duration,
    push_failure_threshold: u32,
    pull_error_threshold: u32,
    pull_backoff_max: Duration,
    state: Mutex<StateInner>,
    mode_tx: watch::Sender<TransportMode>,
    /// Serializes mode switches, which await platform calls.
    switch_lock: tokio::sync::Mutex<()>,
    push_failures: AtomicU32,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportManager {
    pub fn new(
        config: &courier_config::TransportConfig,
        push_url: Option<String>,
        poll_timeout: Duration,
        platform: Arc<dyn Platform>,
        push_probe: Arc<dyn PushProbe>,
        queue: Arc<IngestQueue>,
        recovery: Arc<ErrorRecoveryService>,
    ) -> Self {
        let (mode_tx, _) = watch::channel(TransportMode::Pull);
        Self {
            platform,
            push_probe,
            queue,
            recovery,
            push_url,
            poll_timeout,
            push_check_interval: config.push_check_interval(),
            push_failure_threshold: config.push_failure_threshold,
            pull_error_threshold: config.pull_error_threshold,
            pull_backoff_max: config.pull_backoff_max(),
            state: Mutex::new(StateInner {
                mode: TransportMode::Pull,
                phase: TransportPhase::Stopped,
                last_activity: None,
                mode_switches: 0,
                emergency: false,
            }),
            mode_tx,
            switch_lock: tokio::sync::Mutex::new(()),
            push_failures: AtomicU32::new(0),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn mode(&self) -> TransportMode {
        self.lock().mode
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        let queue_depth = self.queue.depth();
        let inner = self.lock();
        TransportState {
            mode: inner.mode,
            phase: inner.phase,
            running: inner.phase == TransportPhase::Running,
            last_activity: inner.last_activity,
            queue_depth,
            mode_switches: inner.mode_switches,
            emergency: inner.emergency,
        }
    }

    fn set_phase(&self, phase: TransportPhase) {
        self.lock().phase = phase;
    }

    fn set_mode(&self, mode: TransportMode, count_switch: bool) {
        {
            let mut inner = self.lock();
            if count_switch {
                inner.mode_switches += 1;
            }
            inner.mode = mode;
        }
        self.mode_tx.send_replace(mode);
    }

    /// Pick the initial mode, set it up, and spawn the background loops.
    ///
    /// Push is chosen only when a push URL is configured, reachable, and the
    /// webhook registers. Everything else starts in pull mode. Must be called
    /// once per process.
    pub async fn start(self: &Arc<Self>) -> Result<TransportMode> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::transport_unavailable("transport already started"));
        }
        self.set_phase(TransportPhase::Starting);

        let mode = match self.push_url.as_deref() {
            // One registration attempt; pull-side failover retries push later.
            Some(url) if self.push_probe.reachable(url).await => {
                match self.platform.register_webhook(url).await {
                    Ok(()) => TransportMode::Push,
                    Err(e) => {
                        let classification = classify(&e);
                        warn!(
                            kind = %classification.kind,
                            error = %e,
                            "webhook registration failed, starting in pull mode"
                        );
                        self.recovery.history().record(ErrorInfo::new(
                            classification.kind.as_str(),
                            classification.severity,
                            format!("register webhook: {e:#}"),
                        ));
                        TransportMode::Pull
                    },
                }
            },
            Some(url) => {
                info!(url, "push endpoint unreachable, starting in pull mode");
                TransportMode::Pull
            },
            None => TransportMode::Pull,
        };

        if mode == TransportMode::Pull
            && let Err(e) = self.platform.remove_webhook().await
        {
            warn!(error = %e, "failed to clear webhook before polling");
        }

        self.set_mode(mode, false);
        self.set_phase(TransportPhase::Running);

        let pull = tokio::spawn(Arc::clone(self).pull_loop());
        let push = tokio::spawn(Arc::clone(self).push_monitor());
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([pull, push]);

        info!(mode = ?mode, "transport started");
        Ok(mode)
    }

    /// Cancel the loops and wait up to `grace` for each to exit.
    pub async fn stop(&self, grace: Duration) {
        self.set_phase(TransportPhase::Stopping);
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("transport task did not stop within grace period, aborting");
                abort.abort();
            }
        }
        self.set_phase(TransportPhase::Stopped);
        info!("transport stopped");
    }

    /// Switch to pull mode. No-op when already pulling.
    pub async fn switch_to_pull(&self) -> Result<()> {
        let _guard = self.switch_lock.lock().await;
        if self.mode() == TransportMode::Pull {
            return Ok(());
        }
        if let Err(e) = self.platform.remove_webhook().await {
            warn!(error = %e, "failed to remove webhook, polling may conflict until it clears");
        }
        self.set_mode(TransportMode::Pull, true);
        info!(switches = self.lock().mode_switches, "switched to pull mode");
        Ok(())
    }

    /// Switch to push mode. No-op when already pushing.
    pub async fn switch_to_push(&self) -> Result<()> {
        let _guard = self.switch_lock.lock().await;
        if self.mode() == TransportMode::Push {
            return Ok(());
        }
        if self.lock().emergency {
            return Err(Error::transport_unavailable("emergency fallback is active"));
        }
        let url = self
            .push_url
            .as_deref()
            .ok_or_else(|| Error::transport_unavailable("no push url configured"))?;
        self.platform
            .register_webhook(url)
            .await
            .map_err(|e| Error::transport_unavailable(format!("webhook registration: {e:#}")))?;
        self.push_failures.store(0, Ordering::SeqCst);
        self.set_mode(TransportMode::Push, true);
        info!(switches = self.lock().mode_switches, "switched to push mode");
        Ok(())
    }

    /// Tear down push delivery unconditionally and stay in pull mode for the
    /// rest of the process lifetime.
    ///
    /// The mode flips first; the webhook removal is then retried without
    /// holding the switch lock.
    pub async fn emergency_fallback(&self) {
        {
            let _guard = self.switch_lock.lock().await;
            let was_push = {
                let mut inner = self.lock();
                inner.emergency = true;
                inner.mode == TransportMode::Push
            };
            self.set_mode(TransportMode::Pull, was_push);
        }
        error!("emergency fallback: running in pull mode only");
        if let Err(e) = self
            .recovery
            .execute("remove webhook", || self.platform.remove_webhook())
            .await
        {
            warn!(error = %e, "failed to remove webhook during emergency fallback");
        }
    }

    /// Entry point for both transports.
    pub async fn handle_inbound(&self, envelope: Envelope, source: InboundSource) -> Inbound {
        self.lock().last_activity = Some(Utc::now());
        let id = envelope.id();
        match self.queue.enqueue(envelope).await {
            Ok(Enqueued::Queued(_)) => Inbound::Accepted,
            Ok(Enqueued::DispatchedInline) => Inbound::DispatchedInline,
            Err(Error::Duplicate { .. }) => Inbound::Duplicate,
            Err(Error::QueueFull { depth }) => {
                if source == InboundSource::Pull {
                    warn!(update_id = id, depth, "queue full, dropping pulled update");
                }
                Inbound::Rejected
            },
            Err(e) => {
                warn!(update_id = id, error = %e, "update not accepted");
                Inbound::Rejected
            },
        }
    }

    /// One long-poll round. Returns how long to pause before the next one.
    pub async fn poll_once(&self, cursor: &mut PullCursor) -> Duration {
        let result = self
            .platform
            .fetch_updates(cursor.offset, self.poll_timeout)
            .await;
        self.apply_poll(result, cursor).await
    }

    async fn apply_poll(
        &self,
        result: anyhow::Result<Vec<Envelope>>,
        cursor: &mut PullCursor,
    ) -> Duration {
        let err = match result {
            Ok(envelopes) => {
                cursor.consecutive_errors = 0;
                cursor.backoff = INITIAL_PULL_BACKOFF;
                if !envelopes.is_empty() {
                    debug!(count = envelopes.len(), "pulled updates");
                }
                for envelope in envelopes {
                    cursor.offset = cursor.offset.max(envelope.id() + 1);
                    self.handle_inbound(envelope, InboundSource::Pull).await;
                }
                return Duration::ZERO;
            },
            Err(e) => e,
        };

        cursor.consecutive_errors += 1;
        let classification = classify(&err);
        warn!(
            consecutive = cursor.consecutive_errors,
            kind = %classification.kind,
            error = %err,
            "pull transport error"
        );
        self.recovery.history().record(
            ErrorInfo::new(
                classification.kind.as_str(),
                classification.severity,
                format!("pull: {err:#}"),
            )
            .with_retries(cursor.consecutive_errors, self.pull_error_threshold),
        );

        if cursor.consecutive_errors >= self.pull_error_threshold && self.try_push_failover().await
        {
            cursor.consecutive_errors = 0;
            return Duration::ZERO;
        }

        let backoff = cursor.backoff;
        cursor.backoff = (cursor.backoff * 2).min(self.pull_backoff_max);
        if classification.kind == RecoveryKind::RateLimit {
            return backoff.max(self.recovery.wait_for(&classification, cursor.consecutive_errors));
        }
        backoff
    }

    async fn try_push_failover(&self) -> bool {
        let Some(url) = self.push_url.as_deref() else {
            return false;
        };
        if self.lock().emergency {
            return false;
        }
        if !self.push_probe.reachable(url).await {
            info!("push endpoint unreachable, staying in pull mode");
            return false;
        }
        match self.switch_to_push().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "push failover failed");
                false
            },
        }
    }

    async fn pull_loop(self: Arc<Self>) {
        let mut mode_rx = self.mode_tx.subscribe();
        let mut cursor = PullCursor::default();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if *mode_rx.borrow_and_update() != TransportMode::Pull {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    changed = mode_rx.changed() => if changed.is_err() { break },
                }
                continue;
            }

            // Abandon an outstanding long poll on shutdown or mode change.
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = mode_rx.changed() => continue,
                result = self.platform.fetch_updates(cursor.offset, self.poll_timeout) => result,
            };
            let pause = self.apply_poll(result, &mut cursor).await;
            if !pause.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {},
                }
            }
        }
        debug!("pull loop exited");
    }

    /// Probe the push endpoint once. Falls back to pull after
    /// `push_failure_threshold` consecutive failures.
    pub async fn check_push_health(&self) -> bool {
        let Some(url) = self.push_url.as_deref() else {
            return false;
        };
        if self.push_probe.reachable(url).await {
            self.push_failures.store(0, Ordering::SeqCst);
            return true;
        }
        let failures = self.push_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            failures,
            threshold = self.push_failure_threshold,
            "push endpoint probe failed"
        );
        if failures >= self.push_failure_threshold {
            self.push_failures.store(0, Ordering::SeqCst);
            if let Err(e) = self.switch_to_pull().await {
                error!(error = %e, "failed to fall back to pull mode");
            }
        }
        false
    }

    async fn push_monitor(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + self.push_check_interval;
        let mut ticker = tokio::time::interval_at(start, self.push_check_interval);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.mode() == TransportMode::Push {
                        self.check_push_health().await;
                    }
                },
            }
        }
        debug!("push monitor exited");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            history::ErrorHistory,
            queue::tests::{PayloadClassifier, RecordingDispatch, envelope},
            recovery::tests::fast_service,
        },
        std::{collections::VecDeque, sync::atomic::AtomicUsize},
    };

    /// Scripted platform: pops one fetch result per call.
    #[derive(Default)]
    pub struct FakePlatform {
        pub fetches: Mutex<VecDeque<anyhow::Result<Vec<Envelope>>>>,
        pub webhook: Mutex<Option<String>>,
        pub removals: AtomicUsize,
        pub registrations: AtomicUsize,
        pub fail_register: bool,
        /// Number of upcoming `remove_webhook` calls that fail.
        pub failing_removals: AtomicUsize,
    }

    impl FakePlatform {
        pub fn script(&self, result: anyhow::Result<Vec<Envelope>>) {
            self.fetches.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn fetch_updates(&self, _: i64, _: Duration) -> anyhow::Result<Vec<Envelope>> {
            let next = self.fetches.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                },
            }
        }

        async fn register_webhook(&self, url: &str) -> anyhow::Result<()> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            if self.fail_register {
                anyhow::bail!("handler refused webhook");
            }
            *self.webhook.lock().unwrap() = Some(url.to_string());
            Ok(())
        }

        async fn remove_webhook(&self) -> anyhow::Result<()> {
            self.removals.fetch_add(1, Ordering::SeqCst);
            if self
                .failing_removals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("network is unreachable");
            }
            *self.webhook.lock().unwrap() = None;
            Ok(())
        }
    }

    pub struct FixedProbe(pub AtomicBool);

    #[async_trait]
    impl PushProbe for FixedProbe {
        async fn reachable(&self, _: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    pub struct Harness {
        pub platform: Arc<FakePlatform>,
        pub probe: Arc<FixedProbe>,
        pub dispatch: Arc<RecordingDispatch>,
        pub transport: Arc<TransportManager>,
    }

    pub fn harness(push_url: Option<&str>, reachable: bool, max_size: usize) -> Harness {
        harness_with(FakePlatform::default(), push_url, reachable, max_size)
    }

    pub fn harness_with(
        platform: FakePlatform,
        push_url: Option<&str>,
        reachable: bool,
        max_size: usize,
    ) -> Harness {
        let platform = Arc::new(platform);
        let probe = Arc::new(FixedProbe(AtomicBool::new(reachable)));
        let dispatch = Arc::new(RecordingDispatch::default());
        let queue_config = courier_config::QueueConfig {
            max_size,
            ..Default::default()
        };
        let queue = Arc::new(IngestQueue::new(
            &queue_config,
            Arc::new(PayloadClassifier),
            dispatch.clone(),
            Arc::new(ErrorHistory::new(100)),
        ));
        let transport = Arc::new(TransportManager::new(
            &courier_config::TransportConfig::default(),
            push_url.map(str::to_string),
            Duration::from_secs(1),
            platform.clone(),
            probe.clone(),
            queue,
            Arc::new(fast_service(Arc::default())),
        ));
        Harness {
            platform,
            probe,
            dispatch,
            transport,
        }
    }

    #[tokio::test]
    async fn starts_in_push_when_endpoint_reachable() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        assert_eq!(h.transport.start().await.unwrap(), TransportMode::Push);
        assert_eq!(
            h.platform.webhook.lock().unwrap().as_deref(),
            Some("https://bot.example.com/webhook")
        );
        let state = h.transport.state();
        assert!(state.running);
        assert_eq!(state.mode_switches, 0);
        h.transport.stop(Duration::from_secs(1)).await;
        assert_eq!(h.transport.state().phase, TransportPhase::Stopped);
    }

    #[tokio::test]
    async fn starts_in_pull_when_endpoint_unreachable() {
        let h = harness(Some("https://bot.example.com/webhook"), false, 10);
        assert_eq!(h.transport.start().await.unwrap(), TransportMode::Pull);
        assert!(h.platform.webhook.lock().unwrap().is_none());
        assert_eq!(h.platform.removals.load(Ordering::SeqCst), 1);
        h.transport.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_registration_starts_in_pull_after_one_attempt() {
        let platform = FakePlatform {
            fail_register: true,
            ..Default::default()
        };
        let h = harness_with(platform, Some("https://bot.example.com/webhook"), true, 10);
        assert_eq!(h.transport.start().await.unwrap(), TransportMode::Pull);
        assert_eq!(h.platform.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(h.platform.removals.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.recovery.history().len(), 1);
        h.transport.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn emergency_fallback_retries_webhook_removal() {
        let platform = FakePlatform {
            failing_removals: AtomicUsize::new(2),
            ..Default::default()
        };
        let h = harness_with(platform, Some("https://bot.example.com/webhook"), true, 10);
        h.transport.switch_to_push().await.unwrap();

        h.transport.emergency_fallback().await;
        assert_eq!(h.platform.removals.load(Ordering::SeqCst), 3);
        assert!(h.platform.webhook.lock().unwrap().is_none());
        assert_eq!(h.transport.mode(), TransportMode::Pull);
        assert!(h.transport.state().emergency);
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let h = harness(None, false, 10);
        h.transport.start().await.unwrap();
        assert!(matches!(
            h.transport.start().await,
            Err(Error::TransportUnavailable { .. })
        ));
        h.transport.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn switches_are_idempotent_and_counted() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        h.transport.switch_to_pull().await.unwrap();
        assert_eq!(h.transport.state().mode_switches, 0);

        h.transport.switch_to_push().await.unwrap();
        h.transport.switch_to_push().await.unwrap();
        assert_eq!(h.transport.mode(), TransportMode::Push);
        assert_eq!(h.transport.state().mode_switches, 1);

        h.transport.switch_to_pull().await.unwrap();
        assert_eq!(h.transport.state().mode_switches, 2);
        assert!(h.platform.webhook.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn switch_to_push_without_url_fails() {
        let h = harness(None, true, 10);
        assert!(matches!(
            h.transport.switch_to_push().await,
            Err(Error::TransportUnavailable { .. })
        ));
        assert_eq!(h.transport.mode(), TransportMode::Pull);
    }

    #[tokio::test]
    async fn three_pull_errors_fail_over_to_push() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        for _ in 0..3 {
            h.platform
                .script(Err(anyhow::anyhow!("network is unreachable")));
        }
        let mut cursor = PullCursor::default();
        h.transport.poll_once(&mut cursor).await;
        h.transport.poll_once(&mut cursor).await;
        assert_eq!(h.transport.mode(), TransportMode::Pull);
        let pause = h.transport.poll_once(&mut cursor).await;

        assert_eq!(pause, Duration::ZERO);
        assert_eq!(h.transport.mode(), TransportMode::Push);
        assert_eq!(h.transport.state().mode_switches, 1);
        assert_eq!(cursor.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn pull_errors_back_off_without_push_url() {
        let h = harness(None, true, 10);
        for _ in 0..4 {
            h.platform.script(Err(anyhow::anyhow!("connection reset")));
        }
        let mut cursor = PullCursor::default();
        let mut pauses = Vec::new();
        for _ in 0..4 {
            pauses.push(h.transport.poll_once(&mut cursor).await);
        }
        assert_eq!(
            pauses,
            [1, 2, 4, 8].map(Duration::from_secs).to_vec()
        );
        assert_eq!(h.transport.mode(), TransportMode::Pull);
    }

    #[tokio::test]
    async fn pulled_updates_advance_offset_and_enqueue() {
        let h = harness(None, false, 10);
        h.platform
            .script(Ok(vec![envelope(41, 2), envelope(40, 2)]));
        let mut cursor = PullCursor::default();
        h.transport.poll_once(&mut cursor).await;
        assert_eq!(cursor.offset, 42);
        assert_eq!(h.transport.state().queue_depth, 2);
        assert!(h.transport.state().last_activity.is_some());
    }

    #[tokio::test]
    async fn full_queue_rejects_inbound() {
        let h = harness(None, false, 1);
        let first = h
            .transport
            .handle_inbound(envelope(1, 2), InboundSource::Push)
            .await;
        assert_eq!(first, Inbound::Accepted);
        let second = h
            .transport
            .handle_inbound(envelope(2, 2), InboundSource::Push)
            .await;
        assert_eq!(second, Inbound::Rejected);
        let again = h
            .transport
            .handle_inbound(envelope(1, 2), InboundSource::Pull)
            .await;
        assert_eq!(again, Inbound::Duplicate);
        assert!(h.dispatch.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_push_probe_failures_fall_back_to_pull() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        h.transport.switch_to_push().await.unwrap();
        h.probe.0.store(false, Ordering::SeqCst);

        assert!(!h.transport.check_push_health().await);
        assert!(!h.transport.check_push_health().await);
        assert_eq!(h.transport.mode(), TransportMode::Push);
        assert!(!h.transport.check_push_health().await);
        assert_eq!(h.transport.mode(), TransportMode::Pull);
        assert_eq!(h.transport.state().mode_switches, 2);
    }

    #[tokio::test]
    async fn emergency_fallback_is_terminal() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        h.transport.switch_to_push().await.unwrap();
        h.transport.emergency_fallback().await;

        let state = h.transport.state();
        assert_eq!(state.mode, TransportMode::Pull);
        assert!(state.emergency);
        assert!(h.platform.webhook.lock().unwrap().is_none());
        assert!(h.transport.switch_to_push().await.is_err());
    }

    #[tokio::test]
    async fn pull_loop_delivers_into_queue() {
        let platform = FakePlatform::default();
        platform.script(Ok(vec![envelope(5, 2)]));
        let h = harness_with(platform, None, false, 10);
        h.transport.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.state().queue_depth, 1);
        h.transport.stop(Duration::from_secs(1)).await;
    }
}
