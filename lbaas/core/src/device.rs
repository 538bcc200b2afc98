//! The per-appliance operation surface consumed by the reconciler.
//!
//! Implementations wrap a management-API client for a single BIG-IP. Every call may suspend for a
//! long time (device saves are slow), so implementations are expected to enforce their own call
//! timeouts; the reconciler never retries a failed call in place.

use crate::{
    model::{LbMethod, MonitorType, Persistence, Protocol},
    naming::QualifiedName,
};
use ipnet::IpNet;
use serde::Serialize;
use std::{fmt, net::IpAddr, num::NonZeroU16};

/// Faults reported by a device.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// A create call found the object already present. Never an error for the reconciler.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A delete call found the object still referenced by other objects.
    #[error("{0} is still in use")]
    InUse(String),

    /// A folder could not be removed because it still contains objects.
    #[error("folder {0} is not empty")]
    NotEmpty(String),

    #[error("{0} was not found")]
    NotFound(String),

    #[error("device fault: {0}")]
    Unknown(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Pool,
    Member,
    Monitor,
    VirtualServer,
    SelfIp,
    Arp,
    Vlan,
    Tunnel,
    Snat,
    Nat,
}

/// An address as the device sees it: an IP, optionally scoped to a route domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddr {
    pub ip: IpAddr,
    pub route_domain: Option<u16>,
}

/// Identifies a single device object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Pool(QualifiedName),
    Member {
        pool: QualifiedName,
        address: DeviceAddr,
        port: NonZeroU16,
    },
    Monitor(QualifiedName),
    VirtualServer(QualifiedName),
    SelfIp(QualifiedName),
    Arp {
        folder: String,
        address: DeviceAddr,
    },
    Vlan(QualifiedName),
    Tunnel(QualifiedName),
    Snat(QualifiedName),
    Nat(QualifiedName),
}

/// A device object with all of the attributes the agent manages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceObject {
    Pool(PoolSpec),
    Member(MemberSpec),
    Monitor(MonitorSpec),
    VirtualServer(VirtualServerSpec),
    SelfIp(SelfIpSpec),
    Arp(ArpSpec),
    Vlan(VlanSpec),
    Tunnel(TunnelSpec),
    Snat(SnatSpec),
    Nat(NatSpec),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: QualifiedName,
    pub lb_method: LbMethod,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberSpec {
    pub pool: QualifiedName,
    pub address: DeviceAddr,
    pub port: NonZeroU16,
    pub ratio: u32,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorSpec {
    pub name: QualifiedName,
    pub kind: MonitorType,
    pub interval: u32,
    pub timeout: u32,
    pub send: Option<String>,
    pub recv: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VirtualServerKind {
    Standard,

    /// Forwards traffic by destination address without load balancing.
    IpForward,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualServerSpec {
    pub name: QualifiedName,
    pub kind: VirtualServerKind,
    pub destination: DeviceAddr,
    pub mask: IpNet,

    /// Zero matches any port.
    pub port: u16,
    pub protocol: Option<Protocol>,
    pub pool: Option<QualifiedName>,
    pub persistence: Option<Persistence>,
    pub connection_limit: Option<u32>,
    pub vlan: Option<QualifiedName>,
    pub snat_automap: bool,
    pub traffic_group: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelfIpSpec {
    pub name: QualifiedName,
    pub address: DeviceAddr,
    pub prefix_len: u8,
    pub vlan: QualifiedName,
    pub floating: bool,
    pub traffic_group: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpSpec {
    pub folder: String,
    pub address: DeviceAddr,
    pub mac: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VlanSpec {
    pub name: QualifiedName,
    pub tag: Option<u16>,
    pub interface: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TunnelProfile {
    Vxlan,
    Gre,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: QualifiedName,
    pub profile: TunnelProfile,
    pub key: u32,
}

/// Source-address translation for traffic originating in `origins`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnatSpec {
    pub name: QualifiedName,
    pub translation: DeviceAddr,
    pub origins: Vec<IpNet>,
    pub traffic_group: String,
}

/// A static one-to-one address translation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatSpec {
    pub name: QualifiedName,
    pub original: DeviceAddr,
    pub translation: DeviceAddr,
    pub vlan: Option<QualifiedName>,
    pub traffic_group: String,
}

/// Traffic counters for one pool, as posted back to the plugin.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_connections: u64,
    pub total_connections: u64,
}

#[async_trait::async_trait]
pub trait DeviceClient: Send + Sync {
    /// The device's management hostname, used to identify it in logs and device-local names.
    fn hostname(&self) -> &str;

    async fn folder_exists(&self, folder: &str) -> Result<bool, DeviceError>;

    /// Lists every folder on the device, including `Common`.
    async fn list_folders(&self) -> Result<Vec<String>, DeviceError>;

    async fn create_folder(&self, folder: &str, traffic_group: &str) -> Result<(), DeviceError>;

    async fn delete_folder(&self, folder: &str) -> Result<(), DeviceError>;

    /// Removes every object in `folder`, leaving the folder itself in place.
    async fn purge_folder(&self, folder: &str) -> Result<(), DeviceError>;

    /// Switches the device session's active folder. Fails with [`DeviceError::NotFound`] if the
    /// folder does not exist.
    async fn set_active_folder(&self, folder: &str) -> Result<(), DeviceError>;

    async fn route_domain_id(&self, folder: &str) -> Result<Option<u16>, DeviceError>;

    /// Creates the route domain for the active folder, returning its id.
    async fn create_route_domain(&self, folder: &str) -> Result<u16, DeviceError>;

    async fn delete_route_domain(&self, folder: &str) -> Result<(), DeviceError>;

    async fn exists(&self, key: &ObjectKey) -> Result<bool, DeviceError>;

    async fn create(&self, object: &DeviceObject) -> Result<(), DeviceError>;

    async fn update(&self, object: &DeviceObject) -> Result<(), DeviceError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), DeviceError>;

    /// Lists the names of all objects of `kind` in `folder`.
    async fn list(&self, kind: ObjectKind, folder: &str) -> Result<Vec<String>, DeviceError>;

    async fn pool_monitors(&self, pool: &QualifiedName)
        -> Result<Vec<QualifiedName>, DeviceError>;

    async fn set_pool_monitors(
        &self,
        pool: &QualifiedName,
        monitors: &[QualifiedName],
    ) -> Result<(), DeviceError>;

    /// Returns the traffic group the device actually assigned to a self-IP.
    async fn self_ip_traffic_group(&self, name: &QualifiedName) -> Result<String, DeviceError>;

    /// Returns the addresses of every virtual server and pool member in `folder`.
    async fn folder_addresses(&self, folder: &str) -> Result<Vec<IpAddr>, DeviceError>;

    async fn sync_device_group(&self, group: &str, force_now: bool) -> Result<(), DeviceError>;

    async fn pool_stats(&self, pool: &QualifiedName) -> Result<PoolStats, DeviceError>;
}

// === impl DeviceError ===

impl DeviceError {
    #[inline]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// === impl DeviceAddr ===

impl DeviceAddr {
    pub fn new(ip: IpAddr, route_domain: Option<u16>) -> Self {
        Self { ip, route_domain }
    }
}

impl From<IpAddr> for DeviceAddr {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip, None)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.route_domain {
            Some(rd) => write!(f, "{}%{}", self.ip, rd),
            None => write!(f, "{}", self.ip),
        }
    }
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Pool(_) => ObjectKind::Pool,
            Self::Member { .. } => ObjectKind::Member,
            Self::Monitor(_) => ObjectKind::Monitor,
            Self::VirtualServer(_) => ObjectKind::VirtualServer,
            Self::SelfIp(_) => ObjectKind::SelfIp,
            Self::Arp { .. } => ObjectKind::Arp,
            Self::Vlan(_) => ObjectKind::Vlan,
            Self::Tunnel(_) => ObjectKind::Tunnel,
            Self::Snat(_) => ObjectKind::Snat,
            Self::Nat(_) => ObjectKind::Nat,
        }
    }

    /// The folder the object lives in.
    pub fn folder(&self) -> &str {
        match self {
            Self::Pool(n)
            | Self::Monitor(n)
            | Self::VirtualServer(n)
            | Self::SelfIp(n)
            | Self::Vlan(n)
            | Self::Tunnel(n)
            | Self::Snat(n)
            | Self::Nat(n) => &n.folder,
            Self::Member { pool, .. } => &pool.folder,
            Self::Arp { folder, .. } => folder,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(n) => write!(f, "pool {n}"),
            Self::Member {
                pool,
                address,
                port,
            } => write!(f, "member {address}:{port} of {pool}"),
            Self::Monitor(n) => write!(f, "monitor {n}"),
            Self::VirtualServer(n) => write!(f, "virtual server {n}"),
            Self::SelfIp(n) => write!(f, "self-ip {n}"),
            Self::Arp { folder, address } => write!(f, "arp {address} in /{folder}"),
            Self::Vlan(n) => write!(f, "vlan {n}"),
            Self::Tunnel(n) => write!(f, "tunnel {n}"),
            Self::Snat(n) => write!(f, "snat {n}"),
            Self::Nat(n) => write!(f, "nat {n}"),
        }
    }
}

// === impl DeviceObject ===

impl DeviceObject {
    pub fn key(&self) -> ObjectKey {
        match self {
            Self::Pool(p) => ObjectKey::Pool(p.name.clone()),
            Self::Member(m) => ObjectKey::Member {
                pool: m.pool.clone(),
                address: m.address,
                port: m.port,
            },
            Self::Monitor(m) => ObjectKey::Monitor(m.name.clone()),
            Self::VirtualServer(v) => ObjectKey::VirtualServer(v.name.clone()),
            Self::SelfIp(s) => ObjectKey::SelfIp(s.name.clone()),
            Self::Arp(a) => ObjectKey::Arp {
                folder: a.folder.clone(),
                address: a.address,
            },
            Self::Vlan(v) => ObjectKey::Vlan(v.name.clone()),
            Self::Tunnel(t) => ObjectKey::Tunnel(t.name.clone()),
            Self::Snat(s) => ObjectKey::Snat(s.name.clone()),
            Self::Nat(n) => ObjectKey::Nat(n.name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_route_domain_addresses() {
        let ip = "10.1.1.1".parse().unwrap();
        assert_eq!(DeviceAddr::new(ip, None).to_string(), "10.1.1.1");
        assert_eq!(DeviceAddr::new(ip, Some(3)).to_string(), "10.1.1.1%3");
    }

    #[test]
    fn object_keys_know_their_folder() {
        let key = DeviceObject::Member(MemberSpec {
            pool: QualifiedName::new("uuid_t", "uuid_p"),
            address: "10.1.1.2".parse::<IpAddr>().unwrap().into(),
            port: NonZeroU16::new(8080).unwrap(),
            ratio: 1,
            enabled: true,
        })
        .key();
        assert_eq!(key.kind(), ObjectKind::Member);
        assert_eq!(key.folder(), "uuid_t");
        assert_eq!(key.to_string(), "member 10.1.1.2:8080 of /uuid_t/uuid_p");
    }
}
