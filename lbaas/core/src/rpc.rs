use crate::{
    device::PoolStats,
    model::{MemberId, MonitorId, PoolId, Status, SubnetId, VipId},
};
use anyhow::Result;
use std::net::IpAddr;

/// Models the message channel back to the Neutron plugin.
///
/// `get_service` is a request/response call; every other method is a fire-and-forget
/// notification.
#[async_trait::async_trait]
pub trait PluginRpc: Send + Sync {
    /// Pulls the current desired state for a pool as a raw payload.
    async fn get_service(&self, pool: &PoolId) -> Result<serde_json::Value>;

    async fn update_pool_status(&self, pool: &PoolId, status: Status) -> Result<()>;

    async fn pool_destroyed(&self, pool: &PoolId) -> Result<()>;

    async fn update_member_status(&self, member: &MemberId, status: Status) -> Result<()>;

    async fn member_destroyed(&self, member: &MemberId) -> Result<()>;

    async fn update_vip_status(&self, vip: &VipId, status: Status) -> Result<()>;

    async fn vip_destroyed(&self, vip: &VipId) -> Result<()>;

    async fn update_health_monitor_status(
        &self,
        pool: &PoolId,
        monitor: &MonitorId,
        status: Status,
    ) -> Result<()>;

    async fn health_monitor_destroyed(&self, pool: &PoolId, monitor: &MonitorId) -> Result<()>;

    async fn update_pool_stats(&self, pool: &PoolId, stats: PoolStats) -> Result<()>;
}

/// A Neutron port, used to reserve addresses for device-owned self-IPs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub subnet_id: SubnetId,
    pub fixed_ip: IpAddr,
}

/// Reserves fixed addresses on tenant subnets.
#[async_trait::async_trait]
pub trait PortAllocator: Send + Sync {
    async fn get_port_by_name(&self, name: &str) -> Result<Option<Port>>;

    async fn create_port_on_subnet(&self, subnet: &SubnetId, name: &str) -> Result<Port>;

    async fn delete_port_by_name(&self, name: &str) -> Result<()>;
}
