//! Built-in [`RecoveryAction`] implementations.

use std::{
    path::PathBuf,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use {
    async_trait::async_trait,
    tracing::{debug, info, warn},
};

use crate::{
    health::HealthProbe,
    history::ErrorHistory,
    queue::IngestQueue,
    recovery::RecoveryAction,
    transport::{Platform, TransportManager},
};

/// Shrink in-memory bookkeeping: dedup set, queue buffers, error history.
pub struct ReleaseMemory {
    queue: Arc<IngestQueue>,
    history: Arc<ErrorHistory>,
    keep_errors: usize,
}

impl ReleaseMemory {
    #[must_use]
    pub fn new(queue: Arc<IngestQueue>, history: Arc<ErrorHistory>, keep_errors: usize) -> Self {
        Self {
            queue,
            history,
            keep_errors,
        }
    }
}

#[async_trait]
impl RecoveryAction for ReleaseMemory {
    fn name(&self) -> &str {
        "release-memory"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let forgotten = self.queue.release_memory();
        let before = self.history.len();
        self.history.compact(self.keep_errors);
        info!(
            forgotten_ids = forgotten,
            dropped_errors = before.saturating_sub(self.history.len()),
            "released memory"
        );
        Ok(())
    }
}

/// Delete regular files older than `max_age` directly inside `dir`.
pub struct FreeDisk {
    dir: PathBuf,
    max_age: Duration,
}

impl FreeDisk {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }
}

#[async_trait]
impl RecoveryAction for FreeDisk {
    fn name(&self) -> &str {
        "free-disk"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0usize;
        let mut freed = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() || meta.modified()? > cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    freed += meta.len();
                },
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale file"),
            }
        }
        info!(dir = %self.dir.display(), removed, freed_bytes = freed, "freed disk space");
        Ok(())
    }
}

/// Re-run probes as a connection warm-up. Fails while any probe does.
pub struct ProbeReconnect {
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl ProbeReconnect {
    #[must_use]
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self::all(vec![probe])
    }

    /// One action covering several dependencies of the same kind.
    #[must_use]
    pub fn all(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self { probes }
    }
}

#[async_trait]
impl RecoveryAction for ProbeReconnect {
    fn name(&self) -> &str {
        "probe-reconnect"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let results = futures::future::join_all(self.probes.iter().map(|p| p.check())).await;
        let unhealthy = results
            .into_iter()
            .filter(|r| !matches!(r, Ok(true)))
            .count();
        if unhealthy > 0 {
            anyhow::bail!("{unhealthy} dependency(ies) still unhealthy after reconnect");
        }
        debug!(probes = self.probes.len(), "reconnect probes healthy");
        Ok(())
    }
}

/// Drop and rebuild the platform client.
pub struct ResetPlatformClient {
    platform: Arc<dyn Platform>,
}

impl ResetPlatformClient {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl RecoveryAction for ResetPlatformClient {
    fn name(&self) -> &str {
        "reset-platform-client"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.platform.reset().await
    }
}

fn upgrade(transport: &Weak<TransportManager>) -> anyhow::Result<Arc<TransportManager>> {
    transport
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("transport manager is gone"))
}

/// Stop relying on the webhook listener and long-poll instead.
pub struct SwitchToPull {
    transport: Weak<TransportManager>,
}

impl SwitchToPull {
    #[must_use]
    pub fn new(transport: &Arc<TransportManager>) -> Self {
        Self {
            transport: Arc::downgrade(transport),
        }
    }
}

#[async_trait]
impl RecoveryAction for SwitchToPull {
    fn name(&self) -> &str {
        "switch-to-pull"
    }

    async fn run(&self) -> anyhow::Result<()> {
        upgrade(&self.transport)?.switch_to_pull().await?;
        Ok(())
    }
}

/// Remove the webhook for good and stay in pull mode.
pub struct ClearWebhook {
    transport: Weak<TransportManager>,
}

impl ClearWebhook {
    #[must_use]
    pub fn new(transport: &Arc<TransportManager>) -> Self {
        Self {
            transport: Arc::downgrade(transport),
        }
    }
}

#[async_trait]
impl RecoveryAction for ClearWebhook {
    fn name(&self) -> &str {
        "clear-webhook"
    }

    async fn run(&self) -> anyhow::Result<()> {
        upgrade(&self.transport)?.emergency_fallback().await;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            queue::tests::{envelope, queue_with},
            transport::{TransportMode, tests::harness},
        },
        std::sync::atomic::{AtomicBool, Ordering},
    };

    struct Flaky(AtomicBool);

    #[async_trait]
    impl HealthProbe for Flaky {
        async fn check(&self) -> anyhow::Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn probe_reconnect_follows_probe() {
        let probe = Arc::new(Flaky(AtomicBool::new(false)));
        let action = ProbeReconnect::new(probe.clone());
        assert!(action.run().await.is_err());
        probe.0.store(true, Ordering::SeqCst);
        assert!(action.run().await.is_ok());
    }

    #[tokio::test]
    async fn probe_reconnect_needs_every_probe() {
        let up = Arc::new(Flaky(AtomicBool::new(true)));
        let down = Arc::new(Flaky(AtomicBool::new(false)));
        let action = ProbeReconnect::all(vec![up, down.clone()]);
        assert!(action.run().await.is_err());
        down.0.store(true, Ordering::SeqCst);
        assert!(action.run().await.is_ok());
    }

    #[tokio::test]
    async fn free_disk_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.tmp"), b"scratch").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        FreeDisk::new(dir.path(), Duration::from_secs(3600))
            .run()
            .await
            .unwrap();
        assert!(dir.path().join("old.tmp").exists());

        FreeDisk::new(dir.path(), Duration::ZERO).run().await.unwrap();
        assert!(!dir.path().join("old.tmp").exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn release_memory_compacts_history() {
        let queue = Arc::new(queue_with(10, Arc::default()));
        queue.enqueue(envelope(1, 2)).await.unwrap();
        let history = Arc::new(ErrorHistory::new(100));
        for i in 0..20 {
            history.record(crate::history::ErrorInfo::new(
                "network",
                crate::classify::Severity::Medium,
                format!("e{i}"),
            ));
        }
        ReleaseMemory::new(queue, Arc::clone(&history), 5)
            .run()
            .await
            .unwrap();
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn transport_actions_switch_modes() {
        let h = harness(Some("https://bot.example.com/webhook"), true, 10);
        h.transport.switch_to_push().await.unwrap();

        SwitchToPull::new(&h.transport).run().await.unwrap();
        assert_eq!(h.transport.mode(), TransportMode::Pull);
        assert!(!h.transport.state().emergency);

        ClearWebhook::new(&h.transport).run().await.unwrap();
        assert!(h.transport.state().emergency);
    }

    #[tokio::test]
    async fn dropped_transport_fails_action() {
        let h = harness(None, false, 10);
        let action = SwitchToPull::new(&h.transport);
        drop(h);
        assert!(action.run().await.is_err());
    }
}
