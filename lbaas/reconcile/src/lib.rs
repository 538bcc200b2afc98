//! Reconciles Neutron LBaaS services against BIG-IP devices.
//!
//! A single pool's desired state is applied to every device that receives configuration writes:
//!
//! - The [`PartitionManager`] owns tenant folders (and, optionally, a route domain per tenant).
//!   Folders are created on first use and removed once the tenant's last pool, monitor, and
//!   virtual server are gone.
//! - The [`SelfIpManager`] places the device on tenant networks: VLANs and tunnels, a local
//!   self-IP per device and subnet, and a floating gateway per subnet that routes traffic leaving
//!   the subnet back through the device.
//! - The [`ServiceReconciler`] walks one service in dependency order, creating, updating, or
//!   deleting each entity according to its status, and reports which entities it completed.
//! - The [`ClusterSync`] pushes configuration from the config device to its peers once per
//!   reconciliation, retrying with a delay when the device group refuses.
//! - The [`RequestSerializer`] admits at most one reconciliation per pool at a time, in arrival
//!   order.
//!
//! ```text
//! [ Partition ] <- [ Pool ] <- [ Monitor ]
//!                     ^
//!                     +------ [ Member ] -> [ Local self-IP ] -> [ Network ]
//!                     |
//!                  [ Vip ] -> [ Gateway ] ---------------------> [ Network ]
//! ```
//!
//! All device calls that depend on a non-default active folder go through a [`FolderScope`], which
//! serializes access to the folder context on each device.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

mod bigip;
mod cluster;
mod metrics;
mod partition;
mod selfip;
mod serialize;
mod service;
mod sync;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

#[cfg(test)]
mod tests;

pub use self::{
    bigip::{BigIp, FolderScope},
    cluster::{Cluster, HaMode, InvalidMode, SyncMode},
    metrics::Metrics,
    partition::{PartitionError, PartitionManager},
    selfip::{SelfIpError, SelfIpManager},
    serialize::{RequestSerializer, Ticket},
    service::{
        Outcome, ReconcileConfig, ReconcileError, ReconcileReport, ServiceReconciler, Step,
        StepError,
    },
    sync::{ClusterSync, ClusterSyncFailure, SyncConfig},
};
