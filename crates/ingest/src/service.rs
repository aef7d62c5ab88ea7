//! Process-wide wiring of the ingestion singletons.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    serde::Serialize,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    actions::{ClearWebhook, FreeDisk, ProbeReconnect, ReleaseMemory, ResetPlatformClient, SwitchToPull},
    classify::RecoveryKind,
    envelope::{Dispatch, Envelope},
    error::Result,
    health::{HealthMonitor, HealthProbe, HealthReport, Overall, ServiceStatus},
    history::{ErrorHistory, ErrorInfo},
    probes::{DiskSpaceProbe, HttpProbe, MemoryProbe},
    processor::Processor,
    queue::{EnvelopeClassifier, IngestQueue, QueueStats},
    recovery::{ErrorRecoveryService, RecoveryStrategies},
    transport::{Inbound, InboundSource, Platform, PushProbe, TransportManager, TransportMode, TransportState},
};

const RECENT_ERRORS: usize = 20;

/// Per-service line of [`HealthSummary`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub status: ServiceStatus,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub overall: Overall,
    pub mode: TransportMode,
    pub queue_depth: usize,
    pub per_service: Vec<ServiceSummary>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub transport: TransportState,
    pub health: HealthReport,
    pub queue: QueueStats,
    pub recent_errors: Vec<ErrorInfo>,
    pub error_counts: BTreeMap<String, usize>,
}

/// Owns the queue, processor, health monitor, recovery service and
/// transport for the lifetime of the process.
pub struct IngestService {
    queue: Arc<IngestQueue>,
    recovery: Arc<ErrorRecoveryService>,
    health: Arc<HealthMonitor>,
    transport: Arc<TransportManager>,
    processor: Mutex<Option<Processor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl IngestService {
    /// Build every component and register the built-in probes and recovery
    /// actions. Platform and listener probes are registered by the caller
    /// through [`IngestService::health`].
    pub fn new(
        config: &courier_config::CourierConfig,
        platform: Arc<dyn Platform>,
        push_probe: Arc<dyn PushProbe>,
        dispatch: Arc<dyn Dispatch>,
        classifier: Arc<dyn EnvelopeClassifier>,
    ) -> anyhow::Result<Self> {
        let history = Arc::new(ErrorHistory::new(config.recovery.history_capacity));
        let strategies = Arc::new(RecoveryStrategies::new());
        let recovery = Arc::new(ErrorRecoveryService::new(
            &config.recovery,
            Arc::clone(&strategies),
            Arc::clone(&history),
        ));
        let queue = Arc::new(IngestQueue::new(
            &config.queue,
            classifier,
            dispatch,
            Arc::clone(&history),
        ));
        let transport = Arc::new(TransportManager::new(
            &config.transport,
            config.telegram.push_url.clone(),
            config.telegram.poll_timeout(),
            Arc::clone(&platform),
            push_probe,
            Arc::clone(&queue),
            Arc::clone(&recovery),
        ));
        let health = Arc::new(HealthMonitor::new(&config.health, Arc::clone(&strategies)));
        let processor = Processor::new(&config.queue, Arc::clone(&queue), Arc::clone(&recovery));

        strategies.register(
            RecoveryKind::Memory,
            Arc::new(ReleaseMemory::new(
                Arc::clone(&queue),
                Arc::clone(&history),
                config.recovery.history_capacity / 2,
            )),
        );
        strategies.register(
            RecoveryKind::PlatformApi,
            Arc::new(ResetPlatformClient::new(platform)),
        );
        strategies.register(RecoveryKind::Listener, Arc::new(SwitchToPull::new(&transport)));
        if let Some(dir) = &config.recovery.scratch_dir {
            strategies.register(
                RecoveryKind::DiskSpace,
                Arc::new(FreeDisk::new(
                    dir,
                    Duration::from_secs(config.recovery.scratch_max_age_secs),
                )),
            );
        }
        health.set_fallback(Arc::new(ClearWebhook::new(&transport)));

        health.register(
            "memory",
            RecoveryKind::Memory,
            Arc::new(MemoryProbe::new(config.health.min_free_memory_mb)),
        );
        let disk_path = config
            .recovery
            .scratch_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        health.register(
            "disk",
            RecoveryKind::DiskSpace,
            Arc::new(DiskSpaceProbe::new(disk_path, config.health.min_free_disk_mb)),
        );
        let mut datastores: Vec<Arc<dyn HealthProbe>> = Vec::new();
        for service in &config.health.services {
            let probe: Arc<dyn HealthProbe> =
                Arc::new(HttpProbe::new(&service.url, config.health.probe_timeout())?);
            let kind = RecoveryKind::from(service.kind);
            if kind == RecoveryKind::Datastore {
                datastores.push(Arc::clone(&probe));
            }
            health.register(&service.name, kind, probe);
        }
        if !datastores.is_empty() {
            strategies.register(
                RecoveryKind::Datastore,
                Arc::new(ProbeReconnect::all(datastores)),
            );
        }

        Ok(Self {
            queue,
            recovery,
            health,
            transport,
            processor: Mutex::new(Some(processor)),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.queue
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<ErrorRecoveryService> {
        &self.recovery
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    /// Register a probe under `name`. Convenience for adapters.
    pub fn register_probe(&self, name: &str, kind: RecoveryKind, probe: Arc<dyn HealthProbe>) {
        self.health.register(name, kind, probe);
    }

    /// Start the transport and spawn the processor and health loops.
    pub async fn start(&self) -> Result<TransportMode> {
        let mode = self.transport.start().await?;
        let processor = self
            .processor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut tasks = Vec::with_capacity(2);
        if let Some(processor) = processor {
            tasks.push(tokio::spawn(processor.run(self.cancel.child_token())));
        }
        tasks.push(tokio::spawn(
            Arc::clone(&self.health).run(self.cancel.child_token()),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);
        info!(mode = ?mode, "ingest service started");
        Ok(mode)
    }

    /// Entry point for the webhook handler.
    pub async fn accept_push(&self, envelope: Envelope) -> Inbound {
        self.transport
            .handle_inbound(envelope, InboundSource::Push)
            .await
    }

    #[must_use]
    pub fn health_summary(&self) -> HealthSummary {
        let report = self.health.status();
        let transport = self.transport.state();
        HealthSummary {
            overall: report.overall,
            mode: transport.mode,
            queue_depth: transport.queue_depth,
            per_service: report
                .per_service
                .into_iter()
                .map(|s| ServiceSummary {
                    name: s.name,
                    status: s.status,
                    failure_count: s.failure_count,
                    last_error: s.last_error,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        let history = self.recovery.history();
        StatusReport {
            transport: self.transport.state(),
            health: self.health.status(),
            queue: self.queue.stats(),
            recent_errors: history.recent(RECENT_ERRORS),
            error_counts: history.counts_by_kind(),
        }
    }

    /// Cancel every loop and wait up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down ingest service");
        self.cancel.cancel();
        self.transport.stop(grace).await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background loop did not stop within grace period, aborting");
                abort.abort();
            }
        }
        info!(pending = self.queue.depth(), "ingest service stopped");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            queue::tests::{PayloadClassifier, RecordingDispatch, envelope},
            transport::tests::{FakePlatform, FixedProbe},
        },
        std::sync::atomic::AtomicBool,
    };

    fn service(dispatch: Arc<RecordingDispatch>) -> IngestService {
        let mut config = courier_config::CourierConfig::default();
        config.queue.retry_delay_ms = 0;
        config.health.min_free_disk_mb = 0;
        config.health.min_free_memory_mb = 0;
        IngestService::new(
            &config,
            Arc::new(FakePlatform::default()),
            Arc::new(FixedProbe(AtomicBool::new(false))),
            dispatch,
            Arc::new(PayloadClassifier),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn pushes_through_to_dispatch() {
        let dispatch = Arc::new(RecordingDispatch::default());
        let service = service(Arc::clone(&dispatch));
        assert_eq!(service.start().await.unwrap(), TransportMode::Pull);

        assert_eq!(service.accept_push(envelope(9, 2)).await, Inbound::Accepted);
        assert_eq!(service.accept_push(envelope(9, 2)).await, Inbound::Duplicate);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*dispatch.seen.lock().unwrap(), vec![9]);

        service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(service.status().transport.phase, crate::TransportPhase::Stopped);
    }

    #[tokio::test]
    async fn summary_lists_builtin_services() {
        let service = service(Arc::default());
        service.health().check_all().await;
        let summary = service.health_summary();
        let names: Vec<_> = summary.per_service.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["memory", "disk"]);
        assert_eq!(summary.overall, Overall::Healthy);
        assert_eq!(summary.mode, TransportMode::Pull);
        assert_eq!(summary.queue_depth, 0);
    }

    #[tokio::test]
    async fn status_serializes_camel_case() {
        let service = service(Arc::default());
        let json = serde_json::to_value(service.status()).unwrap();
        assert_eq!(json["transport"]["mode"], "PULL");
        assert_eq!(json["transport"]["modeSwitches"], 0);
        assert!(json["recentErrors"].as_array().unwrap().is_empty());
        assert!(json["queue"].get("enqueued").is_some());
    }

    #[tokio::test]
    async fn failed_datastore_gets_reconnect_action() {
        let mut config = courier_config::CourierConfig::default();
        config.health.min_free_disk_mb = 0;
        config.health.min_free_memory_mb = 0;
        config.health.max_failures = 1;
        config.health.probe_timeout_secs = 1;
        config.health.services = vec![courier_config::ServiceProbeConfig {
            name: "db".into(),
            url: "http://127.0.0.1:9/health".into(),
            kind: courier_config::ProbeKind::Datastore,
        }];
        let service = IngestService::new(
            &config,
            Arc::new(FakePlatform::default()),
            Arc::new(FixedProbe(AtomicBool::new(false))),
            Arc::new(RecordingDispatch::default()),
            Arc::new(PayloadClassifier),
        )
        .unwrap();

        let strategies = service.recovery().strategies();
        let action = strategies.get(RecoveryKind::Datastore).unwrap();
        assert_eq!(action.name(), "probe-reconnect");
        // Dispatch backoff is the only remedy for external APIs.
        assert!(strategies.get(RecoveryKind::ExternalApi).is_none());

        service.health().check_all().await;
        let db = service
            .health_summary()
            .per_service
            .into_iter()
            .find(|s| s.name == "db")
            .unwrap();
        assert_eq!(db.status, ServiceStatus::Recovering);
        assert!(action.run().await.is_err());
    }
}
