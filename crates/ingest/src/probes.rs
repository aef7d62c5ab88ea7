//! Built-in [`HealthProbe`] implementations.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    async_trait::async_trait,
    sysinfo::{Disks, System},
    tracing::debug,
};

use crate::health::HealthProbe;

const MB: u64 = 1024 * 1024;

/// Healthy when a GET to `url` answers with a 2xx status.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        let response = self.client.get(&self.url).send().await?;
        debug!(url = %self.url, status = %response.status(), "http probe answered");
        Ok(response.status().is_success())
    }
}

/// Healthy while the filesystem holding `path` has at least `min_free_mb`
/// available.
pub struct DiskSpaceProbe {
    path: PathBuf,
    min_free_bytes: u64,
}

impl DiskSpaceProbe {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, min_free_mb: u64) -> Self {
        Self {
            path: path.into(),
            min_free_bytes: min_free_mb.saturating_mul(MB),
        }
    }
}

/// Available bytes on the disk whose mount point is the longest prefix of
/// `path`.
fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[async_trait]
impl HealthProbe for DiskSpaceProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        let path = std::path::absolute(&self.path)?;
        let Some(available) = tokio::task::spawn_blocking(move || available_space(&path)).await?
        else {
            debug!(path = %self.path.display(), "no disk information, skipping check");
            return Ok(true);
        };
        debug!(available_mb = available / MB, "disk probe");
        Ok(available >= self.min_free_bytes)
    }
}

/// Healthy while the system reports at least `min_available_mb` of memory.
pub struct MemoryProbe {
    min_available_bytes: u64,
}

impl MemoryProbe {
    #[must_use]
    pub fn new(min_available_mb: u64) -> Self {
        Self {
            min_available_bytes: min_available_mb.saturating_mul(MB),
        }
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        let available = tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_memory();
            system.available_memory()
        })
        .await?;
        debug!(available_mb = available / MB, "memory probe");
        Ok(available >= self.min_available_bytes)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_thresholds_are_always_healthy() {
        assert!(MemoryProbe::new(0).check().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        assert!(DiskSpaceProbe::new(dir.path(), 0).check().await.unwrap());
    }

    #[tokio::test]
    async fn impossible_memory_threshold_is_unhealthy() {
        assert!(!MemoryProbe::new(u64::MAX).check().await.unwrap());
    }

    #[tokio::test]
    async fn http_probe_unreachable_is_error() {
        // Port 9 (discard) on localhost is not expected to be listening.
        let probe = HttpProbe::new("http://127.0.0.1:9/health", Duration::from_secs(1)).unwrap();
        assert!(probe.check().await.is_err());
    }
}
