use crate::BigIp;
use std::{str::FromStr, sync::Arc};

/// How the devices are clustered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HaMode {
    Standalone,
    Pair,
    ScaleN,
}

/// How configuration reaches every device in the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Only the config device is written; the device group propagates changes to its peers.
    AutoSync,

    /// Every device is written independently and never synced.
    Replication,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct InvalidMode {
    kind: &'static str,
    value: String,
}

/// The set of devices managed by this agent.
#[derive(Debug)]
pub struct Cluster {
    devices: Vec<Arc<BigIp>>,
    ha_mode: HaMode,
    sync_mode: SyncMode,
    device_group: Option<String>,
}

// === impl Cluster ===

impl Cluster {
    pub fn new(
        devices: Vec<Arc<BigIp>>,
        ha_mode: HaMode,
        sync_mode: SyncMode,
        device_group: Option<String>,
    ) -> Self {
        Self {
            devices,
            ha_mode,
            sync_mode,
            device_group,
        }
    }

    pub fn standalone(device: Arc<BigIp>) -> Self {
        Self::new(vec![device], HaMode::Standalone, SyncMode::AutoSync, None)
    }

    pub fn devices(&self) -> &[Arc<BigIp>] {
        &self.devices
    }

    /// The devices that receive configuration writes.
    pub fn config_devices(&self) -> &[Arc<BigIp>] {
        match self.sync_mode {
            SyncMode::Replication => &self.devices,
            SyncMode::AutoSync => &self.devices[..self.devices.len().min(1)],
        }
    }

    pub fn ha_mode(&self) -> HaMode {
        self.ha_mode
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn device_group(&self) -> Option<&str> {
        self.device_group.as_deref()
    }

    /// Device-group sync only means something when several devices share one configuration.
    pub fn needs_sync(&self) -> bool {
        self.ha_mode != HaMode::Standalone
            && self.sync_mode != SyncMode::Replication
            && self.devices.len() >= 2
    }

    pub fn clear_assured(&self) {
        for bigip in &self.devices {
            bigip.clear_assured();
        }
    }
}

// === impl HaMode ===

impl FromStr for HaMode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(Self::Standalone),
            "pair" => Ok(Self::Pair),
            "scalen" => Ok(Self::ScaleN),
            _ => Err(InvalidMode {
                kind: "HA mode",
                value: s.to_string(),
            }),
        }
    }
}

// === impl SyncMode ===

impl FromStr for SyncMode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autosync" => Ok(Self::AutoSync),
            "replication" => Ok(Self::Replication),
            _ => Err(InvalidMode {
                kind: "sync mode",
                value: s.to_string(),
            }),
        }
    }
}
