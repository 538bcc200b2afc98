//! Core types for the BIG-IP LBaaS agent.
//!
//! The agent reconciles the Neutron LBaaS model against one or more BIG-IP devices:
//!
//! - A [`Service`] is the unit of reconciliation: one pool together with its members, its
//!   optional vip, and the health monitors associated with it. Every entity carries an
//!   externally-assigned [`Status`] that decides what the reconciler does with it.
//! - A [`DeviceClient`] is the per-appliance operation surface. The wire clients themselves live
//!   outside this workspace; the reconciler only sees typed objects and typed faults.
//! - A [`PluginRpc`] is the channel back to the Neutron plugin, used to pull service state and to
//!   post status notifications. Addresses for self-IPs come from a [`PortAllocator`].
//!
//! Every device object name passes through [`Naming::qualify`] so that tenant objects never collide
//! with objects that already exist on the device.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod device;
pub mod model;
mod naming;
pub mod payload;
pub mod rpc;

pub use self::{
    device::{DeviceClient, DeviceError, DeviceObject, ObjectKey, ObjectKind},
    model::{
        EntityRef, HealthMonitor, Member, MemberId, MonitorId, MonitorStatus, Network, NetworkId,
        NetworkType, Pool, PoolId, Service, Status, Subnet, SubnetId, TenantId, Vip, VipId,
    },
    naming::{Naming, QualifiedName, COMMON_FOLDER, DEFAULT_PREFIX},
    payload::PayloadError,
    rpc::{PluginRpc, Port, PortAllocator},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
