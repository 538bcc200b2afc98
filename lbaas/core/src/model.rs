use ahash::AHashMap as HashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{fmt, net::IpAddr, num::NonZeroU16};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

id_type!(
    /// A Neutron tenant (project) identifier.
    TenantId
);
id_type!(PoolId);
id_type!(MemberId);
id_type!(VipId);
id_type!(MonitorId);
id_type!(SubnetId);
id_type!(NetworkId);

/// The provisioning status Neutron assigns to every LBaaS entity.
///
/// The agent never tracks state transitions itself: the status on each entity in the desired
/// service is the only input that decides what happens to the corresponding device object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Active,
    Inactive,
    Error,
}

/// Names a single entity of a service, used when reporting outcomes back to the plugin.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Pool(PoolId),
    Member(MemberId),
    Vip(VipId),
    Monitor { pool: PoolId, monitor: MonitorId },
}

/// A complete desired state for one pool.
#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    pub pool: Pool,
    pub members: Vec<Member>,
    pub vip: Option<Vip>,
    pub monitors: HashMap<MonitorId, HealthMonitor>,
    pub subnets: HashMap<SubnetId, Subnet>,
    pub networks: HashMap<NetworkId, Network>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pool {
    pub id: PoolId,
    pub tenant_id: TenantId,
    pub status: Status,
    pub protocol: Protocol,
    pub lb_method: LbMethod,
    pub description: String,
    pub subnet_id: SubnetId,

    /// Monitors associated with this pool, in the order Neutron lists them.
    pub monitors: Vec<MonitorStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorStatus {
    pub monitor_id: MonitorId,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub address: IpAddr,
    pub protocol_port: NonZeroU16,
    pub weight: u32,
    pub admin_state_up: bool,
    pub subnet_id: SubnetId,
    pub mac_address: Option<String>,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vip {
    pub id: VipId,
    pub address: IpAddr,
    pub protocol: Protocol,
    pub protocol_port: NonZeroU16,
    pub persistence: Option<Persistence>,

    /// `None` means the connection count is not limited.
    pub connection_limit: Option<u32>,
    pub subnet_id: SubnetId,
    pub network_id: NetworkId,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthMonitor {
    pub id: MonitorId,
    pub kind: MonitorType,
    pub delay: u32,
    pub timeout: u32,
    pub max_retries: u32,
    pub http_method: Option<String>,
    pub url_path: Option<String>,
    pub expected_codes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub id: SubnetId,
    pub network_id: NetworkId,
    pub tenant_id: TenantId,
    pub cidr: IpNet,
    pub gateway_ip: Option<IpAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub id: NetworkId,
    pub tenant_id: TenantId,
    pub shared: bool,
    pub kind: NetworkType,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Flat,
    Vlan { tag: u16 },
    Vxlan { vni: u32 },
    Gre { key: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbMethod {
    RoundRobin,
    LeastConnections,
    SourceIp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Persistence {
    SourceIp,
    HttpCookie,
    AppCookie(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorType {
    Ping,
    Tcp,
    Http,
    Https,
}

// === impl Status ===

impl Status {
    #[inline]
    pub fn is_pending_delete(self) -> bool {
        matches!(self, Self::PendingDelete)
    }

    /// Statuses that require no device work.
    #[inline]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Active | Self::Inactive | Self::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingCreate => "PENDING_CREATE",
            Self::PendingUpdate => "PENDING_UPDATE",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

// === impl Service ===

impl Service {
    pub fn tenant_id(&self) -> &TenantId {
        &self.pool.tenant_id
    }

    /// Overwrites the status of every dependent with `PENDING_DELETE` when the pool itself is
    /// pending deletion, so that the pool is never removed while it still has dependents on the
    /// device.
    pub fn cascade_pool_delete(&mut self) {
        if !self.pool.status.is_pending_delete() {
            return;
        }

        if let Some(vip) = self.vip.as_mut() {
            vip.status = Status::PendingDelete;
        }
        for member in self.members.iter_mut() {
            member.status = Status::PendingDelete;
        }
        for monitor in self.pool.monitors.iter_mut() {
            monitor.status = Status::PendingDelete;
        }
    }

    pub fn subnet(&self, id: &SubnetId) -> Option<&Subnet> {
        self.subnets.get(id)
    }

    pub fn network(&self, id: &NetworkId) -> Option<&Network> {
        self.networks.get(id)
    }

    /// Returns the network that owns the given subnet, if both are known.
    pub fn subnet_network(&self, subnet: &Subnet) -> Option<&Network> {
        self.networks.get(&subnet.network_id)
    }
}

// === impl Network ===

impl Network {
    /// The name of the device-side L2 object that carries this network.
    pub fn device_name(&self) -> String {
        match self.kind {
            NetworkType::Flat => format!("flat-{}", self.id),
            NetworkType::Vlan { tag } => format!("vlan-{tag}"),
            NetworkType::Vxlan { vni } => format!("tunnel-vxlan-{vni}"),
            NetworkType::Gre { key } => format!("tunnel-gre-{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: Status) -> Service {
        let subnet_id = SubnetId::from("subnet-1");
        Service {
            pool: Pool {
                id: "pool-1".into(),
                tenant_id: "tenant-1".into(),
                status,
                protocol: Protocol::Http,
                lb_method: LbMethod::RoundRobin,
                description: String::new(),
                subnet_id: subnet_id.clone(),
                monitors: vec![MonitorStatus {
                    monitor_id: "mon-1".into(),
                    status: Status::Active,
                }],
            },
            members: vec![Member {
                id: "member-1".into(),
                address: "10.10.1.2".parse().unwrap(),
                protocol_port: NonZeroU16::new(80).unwrap(),
                weight: 1,
                admin_state_up: true,
                subnet_id: subnet_id.clone(),
                mac_address: None,
                status: Status::PendingUpdate,
            }],
            vip: Some(Vip {
                id: "vip-1".into(),
                address: "10.20.1.99".parse().unwrap(),
                protocol: Protocol::Http,
                protocol_port: NonZeroU16::new(80).unwrap(),
                persistence: None,
                connection_limit: None,
                subnet_id,
                network_id: "net-1".into(),
                status: Status::Active,
            }),
            monitors: HashMap::new(),
            subnets: HashMap::new(),
            networks: HashMap::new(),
        }
    }

    #[test]
    fn pool_delete_cascades_to_dependents() {
        let mut svc = service(Status::PendingDelete);
        svc.cascade_pool_delete();
        assert_eq!(svc.vip.unwrap().status, Status::PendingDelete);
        assert!(svc.members.iter().all(|m| m.status.is_pending_delete()));
        assert!(svc.pool.monitors.iter().all(|m| m.status.is_pending_delete()));
    }

    #[test]
    fn cascade_ignores_live_pools() {
        let mut svc = service(Status::Active);
        let before = svc.clone();
        svc.cascade_pool_delete();
        assert_eq!(svc, before);
    }

    #[test]
    fn network_device_names() {
        let mk = |kind| Network {
            id: "net-1".into(),
            tenant_id: "t".into(),
            shared: false,
            kind,
        };
        assert_eq!(mk(NetworkType::Vlan { tag: 100 }).device_name(), "vlan-100");
        assert_eq!(mk(NetworkType::Flat).device_name(), "flat-net-1");
        assert_eq!(
            mk(NetworkType::Vxlan { vni: 7 }).device_name(),
            "tunnel-vxlan-7"
        );
    }
}
