use super::*;
use crate::fake::{Call, FakeDevice, FakePorts};
use bigip_lbaas_core::{
    device::{DeviceObject, ObjectKey, ObjectKind},
    model::{LbMethod, MonitorType, Protocol},
    EntityRef, HealthMonitor, Member, MonitorId, MonitorStatus, Naming, Network, NetworkId,
    NetworkType, Pool, Service, Status, Subnet, SubnetId, Vip,
};
use maplit::hashmap;
use std::{num::NonZeroU16, sync::Arc};

mod failures;

struct Harness {
    devices: Vec<Arc<FakeDevice>>,
    ports: Arc<FakePorts>,
    reconciler: ServiceReconciler,
}

#[derive(Clone, Copy)]
struct Options {
    devices: usize,
    ha_mode: HaMode,
    sync_mode: SyncMode,
    route_domain_per_tenant: bool,
    global_routed_mode: bool,
    populate_arp: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            devices: 1,
            ha_mode: HaMode::Standalone,
            sync_mode: SyncMode::AutoSync,
            route_domain_per_tenant: false,
            global_routed_mode: false,
            populate_arp: false,
        }
    }
}

fn harness(options: Options) -> Harness {
    let devices = (1..=options.devices)
        .map(|i| Arc::new(FakeDevice::new(format!("bigip-{i}"))))
        .collect::<Vec<_>>();
    let cluster = Arc::new(Cluster::new(
        devices
            .iter()
            .map(|d| Arc::new(BigIp::new(d.clone())))
            .collect(),
        options.ha_mode,
        options.sync_mode,
        Some("dg-1".to_string()),
    ));

    let service = mk_service(Status::PendingCreate);
    let ports = Arc::new(FakePorts::new(
        service.subnets.values().map(|s| (s.id.clone(), s.cidr)),
    ));
    let partitions = PartitionManager::new(Naming::default(), options.route_domain_per_tenant);
    let selfips = SelfIpManager::new(
        partitions.clone(),
        ports.clone(),
        "1.1",
        options.populate_arp,
    );
    let reconciler = ServiceReconciler::new(
        cluster,
        partitions,
        selfips,
        SyncConfig::default(),
        ReconcileConfig {
            global_routed_mode: options.global_routed_mode,
            traffic_group: "traffic-group-1".to_string(),
        },
        Metrics::default(),
    );

    Harness {
        devices,
        ports,
        reconciler,
    }
}

fn port(n: u16) -> NonZeroU16 {
    NonZeroU16::new(n).expect("port must not be zero")
}

fn mk_member(id: &str, address: &str, status: Status) -> Member {
    Member {
        id: id.into(),
        address: address.parse().expect("valid address"),
        protocol_port: port(8080),
        weight: 1,
        admin_state_up: true,
        subnet_id: "sn-members".into(),
        mac_address: None,
        status,
    }
}

/// A tenant pool with two members, an HTTP monitor, and a vip on a separate subnet.
fn mk_service(status: Status) -> Service {
    let subnets = hashmap! {
        SubnetId::from("sn-members") => Subnet {
            id: "sn-members".into(),
            network_id: "net-members".into(),
            tenant_id: "t1".into(),
            cidr: "10.10.1.0/24".parse().expect("valid cidr"),
            gateway_ip: Some("10.10.1.1".parse().expect("valid address")),
        },
        SubnetId::from("sn-vip") => Subnet {
            id: "sn-vip".into(),
            network_id: "net-vip".into(),
            tenant_id: "t1".into(),
            cidr: "10.20.1.0/24".parse().expect("valid cidr"),
            gateway_ip: Some("10.20.1.1".parse().expect("valid address")),
        },
    };
    let networks = hashmap! {
        NetworkId::from("net-members") => Network {
            id: "net-members".into(),
            tenant_id: "t1".into(),
            shared: false,
            kind: NetworkType::Vlan { tag: 100 },
        },
        NetworkId::from("net-vip") => Network {
            id: "net-vip".into(),
            tenant_id: "t1".into(),
            shared: false,
            kind: NetworkType::Vlan { tag: 200 },
        },
    };
    let monitors = hashmap! {
        MonitorId::from("mon-1") => HealthMonitor {
            id: "mon-1".into(),
            kind: MonitorType::Http,
            delay: 5,
            timeout: 2,
            max_retries: 3,
            http_method: Some("GET".into()),
            url_path: Some("/".into()),
            expected_codes: Some("200".into()),
        },
    };

    Service {
        pool: Pool {
            id: "pool-1".into(),
            tenant_id: "t1".into(),
            status,
            protocol: Protocol::Http,
            lb_method: LbMethod::RoundRobin,
            description: String::new(),
            subnet_id: "sn-members".into(),
            monitors: vec![MonitorStatus {
                monitor_id: "mon-1".into(),
                status,
            }],
        },
        members: vec![
            mk_member("member-1", "10.10.1.11", status),
            mk_member("member-2", "10.10.1.12", status),
        ],
        vip: Some(Vip {
            id: "vip-1".into(),
            address: "10.20.1.99".parse().expect("valid address"),
            protocol: Protocol::Http,
            protocol_port: port(80),
            persistence: None,
            connection_limit: None,
            subnet_id: "sn-vip".into(),
            network_id: "net-vip".into(),
            status,
        }),
        monitors: monitors.into_iter().collect(),
        subnets: subnets.into_iter().collect(),
        networks: networks.into_iter().collect(),
    }
}

/// Sets the status of every entity in `service`.
fn with_status(mut service: Service, status: Status) -> Service {
    service.pool.status = status;
    for monitor in service.pool.monitors.iter_mut() {
        monitor.status = status;
    }
    for member in service.members.iter_mut() {
        member.status = status;
    }
    if let Some(vip) = service.vip.as_mut() {
        vip.status = status;
    }
    service
}

fn all_entities(service: &Service) -> Vec<EntityRef> {
    let mut entities = vec![EntityRef::Pool(service.pool.id.clone())];
    entities.extend(service.pool.monitors.iter().map(|m| EntityRef::Monitor {
        pool: service.pool.id.clone(),
        monitor: m.monitor_id.clone(),
    }));
    entities.extend(service.members.iter().map(|m| EntityRef::Member(m.id.clone())));
    entities.extend(service.vip.iter().map(|v| EntityRef::Vip(v.id.clone())));
    entities
}

/// Returns the index of the first call matching `f`.
fn position(calls: &[Call], f: impl Fn(&Call) -> bool) -> usize {
    calls
        .iter()
        .position(f)
        .unwrap_or_else(|| panic!("no matching call in {calls:#?}"))
}

fn is_create(kind: ObjectKind) -> impl Fn(&Call) -> bool {
    move |c| matches!(c, Call::Create(key) if key.kind() == kind)
}

fn is_delete(kind: ObjectKind) -> impl Fn(&Call) -> bool {
    move |c| matches!(c, Call::Delete(key) if key.kind() == kind)
}

fn vip_key() -> ObjectKey {
    ObjectKey::VirtualServer(bigip_lbaas_core::QualifiedName::new("uuid_t1", "uuid_vip-1"))
}

fn members_of(device: &FakeDevice) -> Vec<DeviceObject> {
    device.objects(ObjectKind::Member)
}
