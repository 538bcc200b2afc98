//! Decodes the dictionary-shaped service payload returned by the Neutron plugin into a validated
//! [`Service`].
//!
//! The plugin's payload is loosely typed: an absent vip is an empty object, persistence is a
//! nested object with an optional cookie name, and a connection limit of `-1` means "unlimited".
//! All of that is normalized here so that the reconciler never has to second-guess its input.

use crate::model::*;
use ahash::AHashMap as HashMap;
use ipnet::IpNet;
use serde::Deserialize;
use std::{net::IpAddr, num::NonZeroU16};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed service payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity} {id} references unknown subnet {subnet}")]
    UnknownSubnet {
        entity: &'static str,
        id: String,
        subnet: SubnetId,
    },

    #[error("pool {pool} references unknown health monitor {monitor}")]
    UnknownMonitor { pool: PoolId, monitor: MonitorId },

    #[error("{entity} {id} has an invalid port: {port}")]
    InvalidPort {
        entity: &'static str,
        id: String,
        port: u32,
    },

    #[error("network {network} of type {kind} has no segmentation id")]
    MissingSegmentation { network: NetworkId, kind: String },

    #[error("network {network} has unsupported type {kind}")]
    UnsupportedNetworkType { network: NetworkId, kind: String },

    #[error("persistence type APP_COOKIE on vip {0} requires a cookie name")]
    MissingCookieName(VipId),

    #[error("unknown persistence type {0}")]
    UnknownPersistence(String),
}

#[derive(Debug, Deserialize)]
struct WireService {
    #[serde(default)]
    pool: Option<serde_json::Value>,
    #[serde(default)]
    members: Vec<WireMember>,
    #[serde(default)]
    vip: Option<serde_json::Value>,
    #[serde(default)]
    health_monitors: Vec<WireMonitor>,
    #[serde(default)]
    subnets: HashMap<SubnetId, WireSubnet>,
    #[serde(default)]
    networks: HashMap<NetworkId, WireNetwork>,
}

#[derive(Debug, Deserialize)]
struct WirePool {
    id: PoolId,
    tenant_id: TenantId,
    status: Status,
    protocol: Protocol,
    lb_method: LbMethod,
    #[serde(default)]
    description: Option<String>,
    subnet_id: SubnetId,
    #[serde(default)]
    health_monitors_status: Vec<WireMonitorStatus>,
}

#[derive(Debug, Deserialize)]
struct WireMonitorStatus {
    monitor_id: MonitorId,
    status: Status,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    id: MemberId,
    address: IpAddr,
    protocol_port: u32,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default = "default_true")]
    admin_state_up: bool,
    subnet_id: SubnetId,
    #[serde(default)]
    port: Option<WirePort>,
    status: Status,
}

#[derive(Debug, Deserialize)]
struct WirePort {
    #[serde(default)]
    mac_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireVip {
    id: VipId,
    address: IpAddr,
    protocol: Protocol,
    protocol_port: u32,
    #[serde(default)]
    session_persistence: Option<WirePersistence>,
    #[serde(default)]
    connection_limit: Option<i64>,
    subnet_id: SubnetId,
    #[serde(default)]
    network_id: Option<NetworkId>,
    status: Status,
}

#[derive(Debug, Deserialize)]
struct WirePersistence {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cookie_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMonitor {
    id: MonitorId,
    #[serde(rename = "type")]
    kind: MonitorType,
    delay: u32,
    timeout: u32,
    max_retries: u32,
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    url_path: Option<String>,
    #[serde(default)]
    expected_codes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSubnet {
    id: SubnetId,
    network_id: NetworkId,
    tenant_id: TenantId,
    cidr: IpNet,
    #[serde(default)]
    gateway_ip: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct WireNetwork {
    id: NetworkId,
    tenant_id: TenantId,
    #[serde(default)]
    shared: bool,
    #[serde(rename = "provider:network_type")]
    network_type: String,
    #[serde(rename = "provider:segmentation_id", default)]
    segmentation_id: Option<u32>,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Decodes a service payload.
///
/// Returns `Ok(None)` when the payload carries no pool, which the plugin sends once a pool has
/// already been removed from its database.
pub fn decode(value: serde_json::Value) -> Result<Option<Service>, PayloadError> {
    let WireService {
        pool,
        members,
        vip,
        health_monitors,
        subnets,
        networks,
    } = serde_json::from_value(value)?;

    let pool = match pool.filter(|v| !is_empty_object(v)) {
        Some(pool) => serde_json::from_value::<WirePool>(pool)?,
        None => return Ok(None),
    };

    let subnets = subnets
        .into_values()
        .map(|s| {
            let subnet = Subnet {
                id: s.id,
                network_id: s.network_id,
                tenant_id: s.tenant_id,
                cidr: s.cidr,
                gateway_ip: s.gateway_ip,
            };
            (subnet.id.clone(), subnet)
        })
        .collect::<HashMap<_, _>>();

    let networks = networks
        .into_values()
        .map(|n| {
            let network = mk_network(n)?;
            Ok((network.id.clone(), network))
        })
        .collect::<Result<HashMap<_, _>, PayloadError>>()?;

    let monitors = health_monitors
        .into_iter()
        .map(|m| {
            let monitor = HealthMonitor {
                id: m.id,
                kind: m.kind,
                delay: m.delay,
                timeout: m.timeout,
                max_retries: m.max_retries,
                http_method: m.http_method,
                url_path: m.url_path,
                expected_codes: m.expected_codes,
            };
            (monitor.id.clone(), monitor)
        })
        .collect::<HashMap<_, _>>();

    let pool = mk_pool(pool, &monitors)?;

    let members = members
        .into_iter()
        .map(|m| mk_member(m, &subnets, pool.status))
        .collect::<Result<Vec<_>, _>>()?;

    let vip = match vip.filter(|v| !v.is_null() && !is_empty_object(v)) {
        Some(vip) => Some(mk_vip(serde_json::from_value(vip)?, &subnets, pool.status)?),
        None => None,
    };

    Ok(Some(Service {
        pool,
        members,
        vip,
        monitors,
        subnets,
        networks,
    }))
}

fn is_empty_object(value: &serde_json::Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

fn mk_pool(
    pool: WirePool,
    monitors: &HashMap<MonitorId, HealthMonitor>,
) -> Result<Pool, PayloadError> {
    let statuses = pool
        .health_monitors_status
        .into_iter()
        .map(|WireMonitorStatus { monitor_id, status }| {
            // A monitor that is going away may already be gone from the plugin's database.
            if !status.is_pending_delete() && !monitors.contains_key(&monitor_id) {
                return Err(PayloadError::UnknownMonitor {
                    pool: pool.id.clone(),
                    monitor: monitor_id,
                });
            }
            Ok(MonitorStatus { monitor_id, status })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Pool {
        id: pool.id,
        tenant_id: pool.tenant_id,
        status: pool.status,
        protocol: pool.protocol,
        lb_method: pool.lb_method,
        description: pool.description.unwrap_or_default(),
        subnet_id: pool.subnet_id,
        monitors: statuses,
    })
}

fn mk_member(
    m: WireMember,
    subnets: &HashMap<SubnetId, Subnet>,
    pool_status: Status,
) -> Result<Member, PayloadError> {
    // A member that is going away may outlive its subnet in the plugin's database.
    let deleting = pool_status.is_pending_delete() || m.status.is_pending_delete();
    if !deleting && !subnets.contains_key(&m.subnet_id) {
        return Err(PayloadError::UnknownSubnet {
            entity: "member",
            id: m.id.to_string(),
            subnet: m.subnet_id,
        });
    }
    let protocol_port = mk_port("member", m.id.as_str(), m.protocol_port)?;
    Ok(Member {
        id: m.id,
        address: m.address,
        protocol_port,
        weight: m.weight,
        admin_state_up: m.admin_state_up,
        subnet_id: m.subnet_id,
        mac_address: m.port.and_then(|p| p.mac_address),
        status: m.status,
    })
}

fn mk_vip(
    v: WireVip,
    subnets: &HashMap<SubnetId, Subnet>,
    pool_status: Status,
) -> Result<Vip, PayloadError> {
    let subnet = subnets.get(&v.subnet_id);
    let deleting = pool_status.is_pending_delete() || v.status.is_pending_delete();
    if !deleting && subnet.is_none() {
        return Err(PayloadError::UnknownSubnet {
            entity: "vip",
            id: v.id.to_string(),
            subnet: v.subnet_id,
        });
    }
    // Nothing on the delete path resolves the vip's network, so it may stay unknown.
    let network_id = v
        .network_id
        .or_else(|| subnet.map(|s| s.network_id.clone()))
        .unwrap_or_else(|| NetworkId::from(""));
    let protocol_port = mk_port("vip", v.id.as_str(), v.protocol_port)?;

    let persistence = match v.session_persistence {
        None => None,
        Some(WirePersistence { kind, cookie_name }) => Some(match kind.as_str() {
            "SOURCE_IP" => Persistence::SourceIp,
            "HTTP_COOKIE" => Persistence::HttpCookie,
            "APP_COOKIE" => match cookie_name {
                Some(name) if !name.is_empty() => Persistence::AppCookie(name),
                _ => return Err(PayloadError::MissingCookieName(v.id)),
            },
            _ => return Err(PayloadError::UnknownPersistence(kind.clone())),
        }),
    };

    Ok(Vip {
        id: v.id,
        address: v.address,
        protocol: v.protocol,
        protocol_port,
        persistence,
        connection_limit: v
            .connection_limit
            .filter(|l| *l >= 0)
            .map(|l| u32::try_from(l).unwrap_or(u32::MAX)),
        subnet_id: v.subnet_id,
        network_id,
        status: v.status,
    })
}

fn mk_port(entity: &'static str, id: &str, port: u32) -> Result<NonZeroU16, PayloadError> {
    u16::try_from(port)
        .ok()
        .and_then(NonZeroU16::new)
        .ok_or_else(|| PayloadError::InvalidPort {
            entity,
            id: id.to_string(),
            port,
        })
}

fn mk_network(n: WireNetwork) -> Result<Network, PayloadError> {
    let segmentation = |kind: &str| {
        n.segmentation_id
            .ok_or_else(|| PayloadError::MissingSegmentation {
                network: n.id.clone(),
                kind: kind.to_string(),
            })
    };
    let kind = match n.network_type.as_str() {
        "flat" => NetworkType::Flat,
        "vlan" => {
            let tag = segmentation("vlan")?;
            let tag = u16::try_from(tag).map_err(|_| PayloadError::MissingSegmentation {
                network: n.id.clone(),
                kind: "vlan".to_string(),
            })?;
            NetworkType::Vlan { tag }
        }
        "vxlan" => NetworkType::Vxlan {
            vni: segmentation("vxlan")?,
        },
        "gre" => NetworkType::Gre {
            key: segmentation("gre")?,
        },
        other => {
            return Err(PayloadError::UnsupportedNetworkType {
                network: n.id.clone(),
                kind: other.to_string(),
            })
        }
    };
    Ok(Network {
        id: n.id,
        tenant_id: n.tenant_id,
        shared: n.shared,
        kind,
    })
}
