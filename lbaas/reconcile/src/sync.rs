use crate::{Cluster, Metrics};
use ahash::AHashMap as HashMap;
use bigip_lbaas_core::DeviceError;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Total number of attempts, including the first.
    pub attempts: u32,

    /// How long to wait after a failed attempt.
    pub retry_delay: Duration,
}

/// Pushes configuration from the config device to the rest of its device group.
#[derive(Debug)]
pub struct ClusterSync {
    cluster: Arc<Cluster>,
    config: SyncConfig,

    /// Serializes syncs of the same device group.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    /// Set while changes have been written that have not been synced yet.
    pending: AtomicBool,

    metrics: Metrics,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to sync device group {group} after {attempts} attempts: {source}")]
pub struct ClusterSyncFailure {
    pub group: String,
    pub attempts: u32,
    #[source]
    pub source: DeviceError,
}

// === impl SyncConfig ===

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            retry_delay: Duration::from_secs(130),
        }
    }
}

// === impl ClusterSync ===

impl ClusterSync {
    pub fn new(cluster: Arc<Cluster>, config: SyncConfig, metrics: Metrics) -> Self {
        Self {
            cluster,
            config,
            locks: Mutex::new(HashMap::new()),
            pending: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn group_lock(&self, group: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(group.to_string())
            .or_default()
            .clone()
    }

    /// Syncs `group` from the config device, retrying after failures.
    ///
    /// Only the first attempt may force an immediate sync; retries let the device schedule it.
    /// Returns false when the cluster has nothing to sync.
    pub async fn sync(&self, group: &str, force_now: bool) -> Result<bool, ClusterSyncFailure> {
        if !self.cluster.needs_sync() {
            return Ok(false);
        }
        let Some(bigip) = self.cluster.config_devices().first() else {
            return Ok(false);
        };

        let lock = self.group_lock(group);
        let _guard = lock.lock().await;

        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            self.metrics.sync_attempt();
            let force_now = force_now && attempt == 1;
            match bigip.client().sync_device_group(group, force_now).await {
                Ok(()) => {
                    debug!(device = %bigip.hostname(), %group, attempt, "Synced device group");
                    return Ok(true);
                }
                Err(error) if attempt < attempts => {
                    warn!(device = %bigip.hostname(), %group, attempt, %error, "Device group sync failed; retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    self.metrics.sync_failed();
                    return Err(ClusterSyncFailure {
                        group: group.to_string(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    /// Syncs the configured device group if `changed`, or if an earlier sync never completed.
    pub async fn sync_changes(&self, changed: bool) -> Result<(), ClusterSyncFailure> {
        if changed {
            self.pending.store(true, Ordering::Release);
        }
        if !self.is_pending() {
            return Ok(());
        }

        let Some(group) = self.cluster.device_group() else {
            if self.cluster.needs_sync() {
                warn!("Changes were made but no device group is configured");
            }
            self.pending.store(false, Ordering::Release);
            return Ok(());
        };

        if self.sync(group, false).await? {
            info!(%group, "Synced changes");
        }
        self.pending.store(false, Ordering::Release);
        Ok(())
    }
}
