use crate::BigIp;
use bigip_lbaas_core::{
    device::{DeviceAddr, DeviceError, ObjectKind},
    Naming, TenantId, COMMON_FOLDER,
};
use std::net::IpAddr;
use tracing::{debug, info};

/// Owns the lifecycle of tenant folders and, optionally, their route domains.
#[derive(Clone, Debug)]
pub struct PartitionManager {
    naming: Naming,
    route_domain_per_tenant: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("failed to create folder {folder} on {device}: {source}")]
    Create {
        device: String,
        folder: String,
        #[source]
        source: DeviceError,
    },

    #[error("failed to delete folder {folder} on {device}: {source}")]
    Delete {
        device: String,
        folder: String,
        #[source]
        source: DeviceError,
    },
}

/// Used when a folder has to be re-entered outside of a service's traffic group.
const DEFAULT_TRAFFIC_GROUP: &str = "traffic-group-1";

/// Object kinds whose presence keeps a tenant folder alive.
const TENANT_OBJECTS: [ObjectKind; 3] = [
    ObjectKind::Pool,
    ObjectKind::Monitor,
    ObjectKind::VirtualServer,
];

// === impl PartitionManager ===

impl PartitionManager {
    pub fn new(naming: Naming, route_domain_per_tenant: bool) -> Self {
        Self {
            naming,
            route_domain_per_tenant,
        }
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn route_domain_per_tenant(&self) -> bool {
        self.route_domain_per_tenant
    }

    pub fn folder(&self, tenant: &TenantId) -> String {
        self.naming.folder(tenant.as_str())
    }

    /// Ensures the tenant's folder (and route domain) exist on `bigip`. Returns true if anything
    /// was created.
    pub async fn ensure(
        &self,
        tenant: &TenantId,
        bigip: &BigIp,
        traffic_group: &str,
    ) -> Result<bool, PartitionError> {
        let folder = self.folder(tenant);
        let create_err = |source| PartitionError::Create {
            device: bigip.hostname().to_string(),
            folder: folder.clone(),
            source,
        };

        let mut changed = false;
        if !bigip
            .client()
            .folder_exists(&folder)
            .await
            .map_err(create_err)?
        {
            match bigip.client().create_folder(&folder, traffic_group).await {
                Ok(()) => {
                    info!(device = %bigip.hostname(), %folder, "Created tenant folder");
                    changed = true;
                }
                Err(error) if error.is_already_exists() => {}
                Err(error) => return Err(create_err(error)),
            }
        }

        // The route domain belongs to the folder, so it can only be created once the folder
        // exists and from within it.
        if self.route_domain_per_tenant {
            let scope = bigip
                .enter_folder(&folder, traffic_group)
                .await
                .map_err(create_err)?;
            let created = Self::ensure_route_domain(bigip, &folder).await;
            let exited = scope.exit().await;
            changed |= created.map_err(create_err)?;
            exited.map_err(create_err)?;
        }

        Ok(changed)
    }

    async fn ensure_route_domain(bigip: &BigIp, folder: &str) -> Result<bool, DeviceError> {
        if bigip.client().route_domain_id(folder).await?.is_some() {
            return Ok(false);
        }
        match bigip.client().create_route_domain(folder).await {
            Ok(id) => {
                info!(device = %bigip.hostname(), %folder, route_domain = id, "Created route domain");
                Ok(true)
            }
            Err(error) if error.is_already_exists() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Removes the tenant's folder from `bigip` once nothing in it is still in use.
    ///
    /// Returns false without changing anything when the folder is absent or still holds a pool,
    /// monitor, or virtual server.
    pub async fn teardown(&self, tenant: &TenantId, bigip: &BigIp) -> Result<bool, PartitionError> {
        let folder = self.folder(tenant);
        if folder == COMMON_FOLDER {
            return Ok(false);
        }
        let delete_err = |source| PartitionError::Delete {
            device: bigip.hostname().to_string(),
            folder: folder.clone(),
            source,
        };

        if !bigip
            .client()
            .folder_exists(&folder)
            .await
            .map_err(delete_err)?
        {
            return Ok(false);
        }

        for kind in TENANT_OBJECTS {
            let names = bigip
                .client()
                .list(kind, &folder)
                .await
                .map_err(delete_err)?;
            if !names.is_empty() {
                debug!(device = %bigip.hostname(), %folder, ?kind, remaining = names.len(), "Tenant folder still in use");
                return Ok(false);
            }
        }

        if self.route_domain_per_tenant {
            let scope = bigip
                .enter_folder(&folder, DEFAULT_TRAFFIC_GROUP)
                .await
                .map_err(delete_err)?;
            let deleted = match bigip.client().delete_route_domain(&folder).await {
                Err(error) if error.is_not_found() => Ok(()),
                res => res,
            };
            let exited = scope.exit().await;
            deleted.map_err(delete_err)?;
            exited.map_err(delete_err)?;
        }

        match bigip.client().delete_folder(&folder).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => return Ok(false),
            Err(DeviceError::NotEmpty(_) | DeviceError::InUse(_)) => {
                debug!(device = %bigip.hostname(), %folder, "Purging leftover objects");
                bigip
                    .client()
                    .purge_folder(&folder)
                    .await
                    .map_err(delete_err)?;
                bigip
                    .client()
                    .delete_folder(&folder)
                    .await
                    .map_err(delete_err)?;
            }
            Err(error) => return Err(delete_err(error)),
        }

        info!(device = %bigip.hostname(), %folder, "Deleted tenant folder");
        // Network objects may have gone with the folder.
        bigip.clear_assured();
        Ok(true)
    }

    /// Returns `ip` as the device addresses it within `folder`.
    pub async fn address(
        &self,
        bigip: &BigIp,
        folder: &str,
        ip: IpAddr,
    ) -> Result<DeviceAddr, DeviceError> {
        if !self.route_domain_per_tenant || folder == COMMON_FOLDER {
            return Ok(ip.into());
        }
        let route_domain = bigip.client().route_domain_id(folder).await?;
        Ok(DeviceAddr::new(ip, route_domain))
    }
}
