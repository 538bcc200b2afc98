use crate::{BigIp, PartitionManager};
use bigip_lbaas_core::{
    device::{
        ArpSpec, DeviceError, DeviceObject, ObjectKey, SelfIpSpec, TunnelProfile, TunnelSpec,
        VirtualServerKind, VirtualServerSpec, VlanSpec,
    },
    rpc::{Port, PortAllocator},
    IpNet, Ipv4Net, Ipv6Net, Naming, Network, NetworkType, QualifiedName, Subnet, SubnetId,
    TenantId, COMMON_FOLDER,
};
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, info, warn};

/// Traffic group for addresses that belong to a single device and never fail over.
const LOCAL_ONLY: &str = "traffic-group-local-only";

/// Places devices on tenant networks.
///
/// Each device gets a non-floating self-IP on every subnet it serves, and each subnet that hosts a
/// vip gets a floating gateway: a self-IP at the subnet's gateway address plus a wildcard
/// forwarding virtual server, so that return traffic from members is routed back through the
/// device.
#[derive(Clone)]
pub struct SelfIpManager {
    partitions: PartitionManager,
    ports: Arc<dyn PortAllocator>,
    vlan_interface: String,
    populate_arp: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SelfIpError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to allocate port {port}: {source}")]
    PortAllocation {
        port: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("subnet {0} has no gateway address")]
    NoGateway(SubnetId),
}

// === impl SelfIpManager ===

impl SelfIpManager {
    pub fn new(
        partitions: PartitionManager,
        ports: Arc<dyn PortAllocator>,
        vlan_interface: impl Into<String>,
        populate_arp: bool,
    ) -> Self {
        Self {
            partitions,
            ports,
            vlan_interface: vlan_interface.into(),
            populate_arp,
        }
    }

    fn naming(&self) -> &Naming {
        self.partitions.naming()
    }

    /// Shared networks live in `Common`; all others in their tenant's folder.
    pub fn network_folder(&self, network: &Network) -> String {
        if network.shared {
            return COMMON_FOLDER.to_string();
        }
        self.partitions.folder(&network.tenant_id)
    }

    /// The VLAN or tunnel that carries `network` on the device.
    fn network_object(&self, network: &Network, folder: &str) -> QualifiedName {
        self.naming().qualify(&network.device_name(), folder)
    }

    pub fn network_object_name(&self, network: &Network) -> QualifiedName {
        self.network_object(network, &self.network_folder(network))
    }

    /// Ensures the VLAN or tunnel for `network` exists. Returns true if it was created.
    pub async fn ensure_network(
        &self,
        bigip: &BigIp,
        network: &Network,
    ) -> Result<bool, DeviceError> {
        if bigip.is_network_assured(&network.id) {
            return Ok(false);
        }

        let folder = self.network_folder(network);
        let name = self.network_object(network, &folder);
        let object = match network.kind {
            NetworkType::Flat => DeviceObject::Vlan(VlanSpec {
                name,
                tag: None,
                interface: self.vlan_interface.clone(),
            }),
            NetworkType::Vlan { tag } => DeviceObject::Vlan(VlanSpec {
                name,
                tag: Some(tag),
                interface: self.vlan_interface.clone(),
            }),
            NetworkType::Vxlan { vni } => DeviceObject::Tunnel(TunnelSpec {
                name,
                profile: TunnelProfile::Vxlan,
                key: vni,
            }),
            NetworkType::Gre { key } => DeviceObject::Tunnel(TunnelSpec {
                name,
                profile: TunnelProfile::Gre,
                key,
            }),
        };

        let created = bigip.create_if_missing(&object).await?;
        if created {
            info!(device = %bigip.hostname(), network = %network.id, key = %object.key(), "Created network");
        }
        bigip.assure_network(network.id.clone());
        Ok(created)
    }

    fn local_port_name(bigip: &BigIp, subnet: &SubnetId) -> String {
        format!("local-{}-{}", bigip.hostname(), subnet)
    }

    async fn allocate_port(&self, subnet: &SubnetId, name: &str) -> Result<Port, SelfIpError> {
        let alloc_err = |error: anyhow::Error| SelfIpError::PortAllocation {
            port: name.to_string(),
            source: error.into(),
        };
        if let Some(port) = self
            .ports
            .get_port_by_name(name)
            .await
            .map_err(alloc_err)?
        {
            return Ok(port);
        }
        let port = self
            .ports
            .create_port_on_subnet(subnet, name)
            .await
            .map_err(alloc_err)?;
        debug!(port = %port.name, ip = %port.fixed_ip, "Allocated port");
        Ok(port)
    }

    /// Gives the device its own address on `subnet`. Returns true if the device was changed.
    pub async fn ensure_local_self_ip(
        &self,
        bigip: &BigIp,
        subnet: &Subnet,
        network: &Network,
    ) -> Result<bool, SelfIpError> {
        if bigip.is_local_subnet_assured(&subnet.id) {
            return Ok(false);
        }

        let mut changed = self.ensure_network(bigip, network).await?;

        let folder = self.network_folder(network);
        let port_name = Self::local_port_name(bigip, &subnet.id);
        let port = self.allocate_port(&subnet.id, &port_name).await?;
        let self_ip = DeviceObject::SelfIp(SelfIpSpec {
            name: self.naming().qualify(&port_name, &folder),
            address: self.partitions.address(bigip, &folder, port.fixed_ip).await?,
            prefix_len: subnet.cidr.prefix_len(),
            vlan: self.network_object(network, &folder),
            floating: false,
            traffic_group: LOCAL_ONLY.to_string(),
        });
        if bigip.create_if_missing(&self_ip).await? {
            info!(device = %bigip.hostname(), subnet = %subnet.id, ip = %port.fixed_ip, "Created local self-IP");
            changed = true;
        }

        bigip.assure_local_subnet(subnet.id.clone());
        Ok(changed)
    }

    /// Removes the device's own address from `subnet` and releases its port.
    pub async fn delete_local_self_ip(
        &self,
        bigip: &BigIp,
        subnet: &Subnet,
        network: &Network,
    ) -> Result<bool, SelfIpError> {
        let folder = self.network_folder(network);
        let port_name = Self::local_port_name(bigip, &subnet.id);
        let key = ObjectKey::SelfIp(self.naming().qualify(&port_name, &folder));
        let deleted = bigip.delete_if_exists(&key).await?;
        self.ports
            .delete_port_by_name(&port_name)
            .await
            .map_err(|error| SelfIpError::PortAllocation {
                port: port_name.clone(),
                source: error.into(),
            })?;
        bigip.forget_local_subnet(&subnet.id);
        if deleted {
            info!(device = %bigip.hostname(), subnet = %subnet.id, "Deleted local self-IP");
        }
        Ok(deleted)
    }

    fn gateway_name(&self, subnet: &SubnetId, folder: &str) -> QualifiedName {
        self.naming().qualify(&format!("gw-{subnet}"), folder)
    }

    /// Ensures `subnet` routes through the device.
    ///
    /// Returns the gateway's name and whether the device was changed.
    pub async fn ensure_gateway(
        &self,
        bigip: &BigIp,
        subnet: &Subnet,
        network: &Network,
        traffic_group: &str,
    ) -> Result<(QualifiedName, bool), SelfIpError> {
        let gateway_ip = subnet
            .gateway_ip
            .ok_or_else(|| SelfIpError::NoGateway(subnet.id.clone()))?;
        let folder = self.network_folder(network);
        let name = self.gateway_name(&subnet.id, &folder);
        if bigip.is_gateway_assured(&subnet.id) {
            return Ok((name, false));
        }

        let mut changed = self.ensure_network(bigip, network).await?;
        let vlan = self.network_object(network, &folder);

        let self_ip = DeviceObject::SelfIp(SelfIpSpec {
            name: name.clone(),
            address: self.partitions.address(bigip, &folder, gateway_ip).await?,
            prefix_len: subnet.cidr.prefix_len(),
            vlan: vlan.clone(),
            floating: true,
            traffic_group: traffic_group.to_string(),
        });
        changed |= bigip.create_if_missing(&self_ip).await?;

        // The device may have placed the address in a different traffic group than requested;
        // the forwarding server must follow the address.
        let actual = bigip.client().self_ip_traffic_group(&name).await?;
        if actual != traffic_group {
            debug!(device = %bigip.hostname(), gateway = %name, requested = %traffic_group, %actual, "Gateway placed in another traffic group");
        }

        let (wildcard, mask) = match gateway_ip {
            IpAddr::V4(_) => (
                IpAddr::from([0u8; 4]),
                IpNet::V4(Ipv4Net::default()),
            ),
            IpAddr::V6(_) => (
                IpAddr::from([0u8; 16]),
                IpNet::V6(Ipv6Net::default()),
            ),
        };
        let forwarder = DeviceObject::VirtualServer(VirtualServerSpec {
            name: name.clone(),
            kind: VirtualServerKind::IpForward,
            destination: self.partitions.address(bigip, &folder, wildcard).await?,
            mask,
            port: 0,
            protocol: None,
            pool: None,
            persistence: None,
            connection_limit: None,
            vlan: Some(vlan),
            snat_automap: true,
            traffic_group: Some(actual),
        });
        changed |= bigip.create_if_missing(&forwarder).await?;

        if changed {
            info!(device = %bigip.hostname(), subnet = %subnet.id, gateway = %name, "Created gateway");
        }
        bigip.assure_gateway(subnet.id.clone());
        Ok((name, changed))
    }

    /// Removes the gateway for `subnet`.
    ///
    /// Without a known network there is nothing to resolve the gateway's folder against, so no
    /// device calls are made and `None` is returned.
    pub async fn delete_gateway(
        &self,
        bigip: &BigIp,
        subnet: &Subnet,
        network: Option<&Network>,
    ) -> Result<Option<(QualifiedName, bool)>, SelfIpError> {
        let Some(network) = network else {
            warn!(device = %bigip.hostname(), subnet = %subnet.id, network = %subnet.network_id, "Cannot delete gateway for subnet without its network");
            return Ok(None);
        };

        let folder = self.network_folder(network);
        let name = self.gateway_name(&subnet.id, &folder);

        // The forwarder references the self-IP's VLAN, so it goes first.
        let mut changed = bigip
            .delete_if_exists(&ObjectKey::VirtualServer(name.clone()))
            .await?;
        changed |= bigip
            .delete_if_exists(&ObjectKey::SelfIp(name.clone()))
            .await?;
        if self.populate_arp {
            if let Some(gateway_ip) = subnet.gateway_ip {
                changed |= self.delete_arp(bigip, &folder, gateway_ip).await?;
            }
        }

        bigip.forget_gateway(&subnet.id);
        if changed {
            info!(device = %bigip.hostname(), subnet = %subnet.id, gateway = %name, "Deleted gateway");
        }
        Ok(Some((name, changed)))
    }

    /// Returns true when a vip or member address that falls inside `subnet` remains on the device.
    ///
    /// Presence on a shared network serves every tenant, so all folders on the device are
    /// searched. Otherwise only the tenant's folder and the network's own folder can hold users.
    pub async fn subnet_in_use(
        &self,
        bigip: &BigIp,
        tenant: &TenantId,
        subnet: &Subnet,
        network: Option<&Network>,
    ) -> Result<bool, DeviceError> {
        let mut folders = match network {
            Some(network) if network.shared => bigip.client().list_folders().await?,
            Some(network) => vec![self.network_folder(network)],
            None => Vec::new(),
        };
        let tenant_folder = self.partitions.folder(tenant);
        if !folders.contains(&tenant_folder) {
            folders.insert(0, tenant_folder);
        }

        for folder in &folders {
            let addresses = bigip.client().folder_addresses(folder).await?;
            if let Some(ip) = addresses.iter().find(|ip| subnet.cidr.contains(*ip)) {
                debug!(device = %bigip.hostname(), subnet = %subnet.id, %folder, %ip, "Subnet is referenced");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes the device's presence on `subnet` once no vip or member uses it.
    pub async fn teardown_subnet(
        &self,
        bigip: &BigIp,
        tenant: &TenantId,
        subnet: &Subnet,
        network: Option<&Network>,
        global_routed_mode: bool,
    ) -> Result<bool, SelfIpError> {
        if self.subnet_in_use(bigip, tenant, subnet, network).await? {
            debug!(device = %bigip.hostname(), subnet = %subnet.id, "Subnet still in use");
            return Ok(false);
        }
        if global_routed_mode {
            return Ok(false);
        }

        let mut changed = false;
        if let Some((_, deleted)) = self.delete_gateway(bigip, subnet, network).await? {
            changed |= deleted;
        }
        if let Some(network) = network {
            changed |= self.delete_local_self_ip(bigip, subnet, network).await?;
        }
        Ok(changed)
    }

    /// Pins `ip` to `mac` in `folder`. A no-op unless ARP population is enabled.
    pub async fn ensure_arp(
        &self,
        bigip: &BigIp,
        folder: &str,
        ip: IpAddr,
        mac: &str,
    ) -> Result<bool, DeviceError> {
        if !self.populate_arp {
            return Ok(false);
        }
        let arp = DeviceObject::Arp(ArpSpec {
            folder: folder.to_string(),
            address: self.partitions.address(bigip, folder, ip).await?,
            mac: mac.to_string(),
        });
        bigip.create_if_missing(&arp).await
    }

    pub async fn delete_arp(
        &self,
        bigip: &BigIp,
        folder: &str,
        ip: IpAddr,
    ) -> Result<bool, DeviceError> {
        if !self.populate_arp {
            return Ok(false);
        }
        let key = ObjectKey::Arp {
            folder: folder.to_string(),
            address: self.partitions.address(bigip, folder, ip).await?,
        };
        bigip.delete_if_exists(&key).await
    }
}

impl std::fmt::Debug for SelfIpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfIpManager")
            .field("partitions", &self.partitions)
            .field("vlan_interface", &self.vlan_interface)
            .field("populate_arp", &self.populate_arp)
            .finish_non_exhaustive()
    }
}
