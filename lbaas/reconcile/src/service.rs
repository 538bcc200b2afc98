use crate::{
    BigIp, Cluster, ClusterSync, ClusterSyncFailure, Metrics, PartitionError, PartitionManager,
    SelfIpError, SelfIpManager, SyncConfig,
};
use bigip_lbaas_core::{
    device::{
        DeviceError, DeviceObject, MemberSpec, MonitorSpec, ObjectKey, PoolSpec, PoolStats,
        VirtualServerKind, VirtualServerSpec,
    },
    model::MonitorType,
    EntityRef, HealthMonitor, IpNet, Member, MonitorId, MonitorStatus, Network, NetworkId, PoolId,
    QualifiedName, Service, Status, Subnet, SubnetId, TenantId, Vip,
};
use futures::future;
use std::{collections::BTreeSet, fmt, sync::Arc};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// When set, vips and members are reachable without per-subnet self-IPs or gateways.
    pub global_routed_mode: bool,

    /// The traffic group that owns floating addresses and vips.
    pub traffic_group: String,
}

/// Applies one service's desired state to every config device of the cluster.
#[derive(Debug)]
pub struct ServiceReconciler {
    cluster: Arc<Cluster>,
    partitions: PartitionManager,
    selfips: SelfIpManager,
    sync: ClusterSync,
    config: ReconcileConfig,
    metrics: Metrics,
}

/// The pipeline step a device failure occurred in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Partition,
    Pool,
    Monitor,
    MonitorAssociation,
    SelfIp,
    Gateway,
    Arp,
    Member,
    Vip,
    SubnetTeardown,
    PartitionTeardown,
}

#[derive(Debug, thiserror::Error)]
#[error("{step} failed on {device}: {source}")]
pub struct ReconcileError {
    pub device: String,
    pub step: Step,
    #[source]
    pub source: StepError,
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    SelfIp(#[from] SelfIpError),

    #[error("subnet {0} is not part of the service")]
    UnknownSubnet(SubnetId),

    #[error("network {0} is not part of the service")]
    UnknownNetwork(NetworkId),

    #[error("monitor {0} is not part of the service")]
    UnknownMonitor(MonitorId),
}

/// What happened to an entity, as reported back to the plugin.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The entity was created or updated.
    Active,
    Destroyed,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Entities completed on every config device, in the order they were applied.
    pub outcomes: Vec<(EntityRef, Outcome)>,

    /// At most one error per device; each aborted the remaining steps on its device.
    pub errors: Vec<ReconcileError>,
}

/// The state of a single service pass on a single device.
struct DevicePass<'a> {
    reconciler: &'a ServiceReconciler,
    bigip: &'a BigIp,
    service: &'a Service,
    folder: String,
    pool_name: QualifiedName,
    completed: Vec<(EntityRef, Outcome)>,
    changed: bool,

    /// Subnets that lost a vip or member during this pass.
    released_subnets: BTreeSet<SubnetId>,
}

struct DeviceResult {
    completed: Vec<(EntityRef, Outcome)>,
    changed: bool,
    error: Option<ReconcileError>,
}

// === impl ServiceReconciler ===

impl ServiceReconciler {
    pub fn new(
        cluster: Arc<Cluster>,
        partitions: PartitionManager,
        selfips: SelfIpManager,
        sync: SyncConfig,
        config: ReconcileConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            sync: ClusterSync::new(cluster.clone(), sync, metrics.clone()),
            cluster,
            partitions,
            selfips,
            config,
            metrics,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    /// Reconciles `service` on every config device and syncs the cluster if anything changed.
    ///
    /// Device failures are collected in the report rather than returned; only a failure to sync
    /// the cluster fails the call.
    pub async fn reconcile(
        &self,
        mut service: Service,
    ) -> Result<ReconcileReport, ClusterSyncFailure> {
        service.cascade_pool_delete();

        let devices = self.cluster.config_devices();
        let passes = future::join_all(
            devices
                .iter()
                .map(|bigip| self.reconcile_device(bigip, &service)),
        )
        .await;

        let mut changed = false;
        let mut report = ReconcileReport::default();
        let mut outcomes: Option<Vec<(EntityRef, Outcome)>> = None;
        for pass in passes {
            changed |= pass.changed;
            if let Some(error) = pass.error {
                self.metrics.device_error(error.step);
                report.errors.push(error);
            }
            // Only entities completed on every device are reported.
            outcomes = Some(match outcomes {
                None => pass.completed,
                Some(mut outcomes) => {
                    outcomes.retain(|o| pass.completed.contains(o));
                    outcomes
                }
            });
        }
        report.outcomes = outcomes.unwrap_or_default();

        if let Err(error) = self.sync.sync_changes(changed).await {
            self.metrics.reconciled("sync_failure");
            return Err(error);
        }

        self.metrics.reconciled(if report.errors.is_empty() {
            "success"
        } else {
            "failure"
        });
        Ok(report)
    }

    async fn reconcile_device(&self, bigip: &BigIp, service: &Service) -> DeviceResult {
        let folder = self.partitions.folder(service.tenant_id());
        let mut pass = DevicePass {
            reconciler: self,
            bigip,
            service,
            pool_name: self
                .partitions
                .naming()
                .qualify(service.pool.id.as_str(), &folder),
            folder,
            completed: Vec::new(),
            changed: false,
            released_subnets: BTreeSet::new(),
        };

        let span = info_span!("device", device = %bigip.hostname());
        let error = match pass.run().instrument(span).await {
            Ok(()) => None,
            Err(error) => {
                warn!(device = %bigip.hostname(), pool = %service.pool.id, step = %error.step, error = %error.source, "Reconciliation aborted");
                Some(error)
            }
        };

        DeviceResult {
            completed: pass.completed,
            changed: pass.changed,
            error,
        }
    }

    /// Flushes cached network presence on every device.
    pub fn clear_caches(&self) {
        self.cluster.clear_assured();
    }

    /// Reads a pool's traffic statistics from the first config device.
    ///
    /// Returns `None` when the pool does not exist on the device.
    pub async fn pool_stats(
        &self,
        tenant: &TenantId,
        pool: &PoolId,
    ) -> Result<Option<PoolStats>, DeviceError> {
        let Some(bigip) = self.cluster.config_devices().first() else {
            return Ok(None);
        };
        let folder = self.partitions.folder(tenant);
        let name = self.partitions.naming().qualify(pool.as_str(), &folder);
        match bigip.client().pool_stats(&name).await {
            Ok(stats) => Ok(Some(stats)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }
}

// === impl DevicePass ===

/// Attributes a failure to `step` on `bigip`.
fn at<E: Into<StepError>>(bigip: &BigIp, step: Step) -> impl FnOnce(E) -> ReconcileError + '_ {
    move |error| ReconcileError {
        device: bigip.hostname().to_string(),
        step,
        source: error.into(),
    }
}

impl<'a> DevicePass<'a> {
    fn tenant_folder_naming(&self, name: &str) -> QualifiedName {
        self.reconciler
            .partitions
            .naming()
            .qualify(name, &self.folder)
    }

    fn complete(&mut self, entity: EntityRef, status: Status) {
        let outcome = match status {
            Status::PendingDelete => Outcome::Destroyed,
            _ => Outcome::Active,
        };
        self.completed.push((entity, outcome));
    }

    async fn run(&mut self) -> Result<(), ReconcileError> {
        if self.service.pool.status.is_pending_delete() {
            // Dependents first, so that nothing on the device still references what is removed.
            self.vip().await?;
            self.members().await?;
            self.monitors().await?;
            self.delete_pool().await?;
            self.release_subnets().await?;
            self.teardown_partition().await
        } else {
            let changed = self
                .reconciler
                .partitions
                .ensure(
                    self.service.tenant_id(),
                    self.bigip,
                    &self.reconciler.config.traffic_group,
                )
                .await
                .map_err(at(self.bigip, Step::Partition))?;
            self.changed |= changed;

            self.pool().await?;
            self.monitors().await?;
            self.members().await?;
            self.vip().await?;
            self.release_subnets().await
        }
    }

    async fn pool(&mut self) -> Result<(), ReconcileError> {
        let service = self.service;
        let pool = &service.pool;
        if pool.status.is_settled() {
            return Ok(());
        }

        let object = DeviceObject::Pool(PoolSpec {
            name: self.pool_name.clone(),
            lb_method: pool.lb_method,
            description: pool.description.clone(),
        });
        let changed = match pool.status {
            Status::PendingUpdate => self.bigip.create_or_update(&object).await,
            _ => self.bigip.create_if_missing(&object).await,
        }
        .map_err(at(self.bigip, Step::Pool))?;

        self.changed |= changed;
        self.complete(EntityRef::Pool(pool.id.clone()), pool.status);
        Ok(())
    }

    async fn delete_pool(&mut self) -> Result<(), ReconcileError> {
        let key = ObjectKey::Pool(self.pool_name.clone());
        if self
            .bigip
            .delete_if_exists(&key)
            .await
            .map_err(at(self.bigip, Step::Pool))?
        {
            info!(pool = %self.service.pool.id, "Deleted pool");
            self.changed = true;
        }
        self.complete(
            EntityRef::Pool(self.service.pool.id.clone()),
            Status::PendingDelete,
        );
        Ok(())
    }

    async fn monitors(&mut self) -> Result<(), ReconcileError> {
        let service = self.service;
        for MonitorStatus { monitor_id, status } in &service.pool.monitors {
            match status {
                Status::PendingCreate | Status::PendingUpdate => {
                    let monitor = service.monitors.get(monitor_id).ok_or_else(|| {
                        at(self.bigip, Step::Monitor)(StepError::UnknownMonitor(monitor_id.clone()))
                    })?;
                    self.apply_monitor(monitor, *status).await?;
                }
                Status::PendingDelete => self.delete_monitor(monitor_id).await?,
                _ => continue,
            }
            self.complete(
                EntityRef::Monitor {
                    pool: service.pool.id.clone(),
                    monitor: monitor_id.clone(),
                },
                *status,
            );
        }
        Ok(())
    }

    async fn apply_monitor(
        &mut self,
        monitor: &HealthMonitor,
        status: Status,
    ) -> Result<(), ReconcileError> {
        let name = self.tenant_folder_naming(monitor.id.as_str());
        let object = DeviceObject::Monitor(monitor_spec(name.clone(), monitor));
        self.changed |= match status {
            Status::PendingUpdate => self.bigip.create_or_update(&object).await,
            _ => self.bigip.create_if_missing(&object).await,
        }
        .map_err(at(self.bigip, Step::Monitor))?;

        // Association is a separate call on the pool.
        let mut monitors = self.pool_monitors().await?;
        if !monitors.contains(&name) {
            monitors.push(name);
            self.bigip
                .client()
                .set_pool_monitors(&self.pool_name, &monitors)
                .await
                .map_err(at(self.bigip, Step::MonitorAssociation))?;
            self.changed = true;
        }
        Ok(())
    }

    async fn delete_monitor(&mut self, monitor: &MonitorId) -> Result<(), ReconcileError> {
        let name = self.tenant_folder_naming(monitor.as_str());

        let monitors = self.pool_monitors().await?;
        if monitors.contains(&name) {
            let remaining = monitors
                .into_iter()
                .filter(|m| *m != name)
                .collect::<Vec<_>>();
            self.bigip
                .client()
                .set_pool_monitors(&self.pool_name, &remaining)
                .await
                .map_err(at(self.bigip, Step::MonitorAssociation))?;
            self.changed = true;
        }

        match self
            .bigip
            .delete_if_exists(&ObjectKey::Monitor(name.clone()))
            .await
        {
            Ok(deleted) => self.changed |= deleted,
            // Still associated with another pool; only this pool's association is gone.
            Err(DeviceError::InUse(_)) => {
                debug!(monitor = %name, "Monitor is still in use by other pools");
            }
            Err(error) => return Err(at(self.bigip, Step::Monitor)(error)),
        }
        Ok(())
    }

    async fn pool_monitors(&self) -> Result<Vec<QualifiedName>, ReconcileError> {
        match self.bigip.client().pool_monitors(&self.pool_name).await {
            Ok(monitors) => Ok(monitors),
            Err(error) if error.is_not_found() => Ok(Vec::new()),
            Err(error) => Err(at(self.bigip, Step::MonitorAssociation)(error)),
        }
    }

    async fn members(&mut self) -> Result<(), ReconcileError> {
        let service = self.service;
        for member in &service.members {
            match member.status {
                Status::PendingCreate | Status::PendingUpdate => self.apply_member(member).await?,
                Status::PendingDelete => self.delete_member(member).await?,
                _ => continue,
            }
            self.complete(EntityRef::Member(member.id.clone()), member.status);
        }
        Ok(())
    }

    fn subnet(&self, id: &SubnetId, step: Step) -> Result<&'a Subnet, ReconcileError> {
        let service: &'a Service = self.service;
        service
            .subnet(id)
            .ok_or_else(|| at(self.bigip, step)(StepError::UnknownSubnet(id.clone())))
    }

    fn subnet_network(
        &self,
        subnet: &Subnet,
        step: Step,
    ) -> Result<&'a Network, ReconcileError> {
        let service: &'a Service = self.service;
        service.subnet_network(subnet).ok_or_else(|| {
            at(self.bigip, step)(StepError::UnknownNetwork(subnet.network_id.clone()))
        })
    }

    async fn member_object(&self, member: &Member) -> Result<DeviceObject, ReconcileError> {
        let address = self
            .reconciler
            .partitions
            .address(self.bigip, &self.folder, member.address)
            .await
            .map_err(at(self.bigip, Step::Member))?;
        Ok(DeviceObject::Member(MemberSpec {
            pool: self.pool_name.clone(),
            address,
            port: member.protocol_port,
            ratio: member.weight,
            enabled: member.admin_state_up,
        }))
    }

    async fn apply_member(&mut self, member: &Member) -> Result<(), ReconcileError> {
        let reconciler = self.reconciler;
        let selfips = &reconciler.selfips;

        // The device needs an address on the member's subnet before it can reach the member.
        if !self.reconciler.config.global_routed_mode {
            let subnet = self.subnet(&member.subnet_id, Step::SelfIp)?;
            let network = self.subnet_network(subnet, Step::SelfIp)?;
            self.changed |= selfips
                .ensure_local_self_ip(self.bigip, subnet, network)
                .await
                .map_err(at(self.bigip, Step::SelfIp))?;
        }

        let object = self.member_object(member).await?;
        self.changed |= match member.status {
            Status::PendingUpdate => self.bigip.create_or_update(&object).await,
            _ => self.bigip.create_if_missing(&object).await,
        }
        .map_err(at(self.bigip, Step::Member))?;

        if let Some(mac) = member.mac_address.as_deref() {
            self.changed |= selfips
                .ensure_arp(self.bigip, &self.folder, member.address, mac)
                .await
                .map_err(at(self.bigip, Step::Arp))?;
        }
        Ok(())
    }

    async fn delete_member(&mut self, member: &Member) -> Result<(), ReconcileError> {
        let key = self.member_object(member).await?.key();
        self.changed |= self
            .bigip
            .delete_if_exists(&key)
            .await
            .map_err(at(self.bigip, Step::Member))?;

        if member.mac_address.is_some() {
            self.changed |= self
                .reconciler
                .selfips
                .delete_arp(self.bigip, &self.folder, member.address)
                .await
                .map_err(at(self.bigip, Step::Arp))?;
        }
        self.released_subnets.insert(member.subnet_id.clone());
        Ok(())
    }

    async fn vip(&mut self) -> Result<(), ReconcileError> {
        let service = self.service;
        let Some(vip) = service.vip.as_ref() else {
            return Ok(());
        };
        match vip.status {
            Status::PendingCreate | Status::PendingUpdate => self.apply_vip(vip).await?,
            Status::PendingDelete => self.delete_vip(vip).await?,
            _ => return Ok(()),
        }
        self.complete(EntityRef::Vip(vip.id.clone()), vip.status);
        Ok(())
    }

    async fn apply_vip(&mut self, vip: &Vip) -> Result<(), ReconcileError> {
        let reconciler = self.reconciler;
        let selfips = &reconciler.selfips;
        let config = &reconciler.config;

        let mut vlan = None;
        if !config.global_routed_mode {
            let subnet = self.subnet(&vip.subnet_id, Step::Gateway)?;
            let network = self.subnet_network(subnet, Step::Gateway)?;
            self.changed |= selfips
                .ensure_local_self_ip(self.bigip, subnet, network)
                .await
                .map_err(at(self.bigip, Step::SelfIp))?;
            let (_, changed) = selfips
                .ensure_gateway(self.bigip, subnet, network, &config.traffic_group)
                .await
                .map_err(at(self.bigip, Step::Gateway))?;
            self.changed |= changed;
            vlan = Some(selfips.network_object_name(network));
        }

        let destination = self
            .reconciler
            .partitions
            .address(self.bigip, &self.folder, vip.address)
            .await
            .map_err(at(self.bigip, Step::Vip))?;
        let object = DeviceObject::VirtualServer(VirtualServerSpec {
            name: self.tenant_folder_naming(vip.id.as_str()),
            kind: VirtualServerKind::Standard,
            destination,
            mask: IpNet::from(vip.address),
            port: vip.protocol_port.get(),
            protocol: Some(vip.protocol),
            pool: Some(self.pool_name.clone()),
            persistence: vip.persistence.clone(),
            connection_limit: vip.connection_limit,
            vlan,
            snat_automap: true,
            traffic_group: Some(config.traffic_group.clone()),
        });
        self.changed |= match vip.status {
            Status::PendingUpdate => self.bigip.create_or_update(&object).await,
            _ => self.bigip.create_if_missing(&object).await,
        }
        .map_err(at(self.bigip, Step::Vip))?;
        Ok(())
    }

    async fn delete_vip(&mut self, vip: &Vip) -> Result<(), ReconcileError> {
        let key = ObjectKey::VirtualServer(self.tenant_folder_naming(vip.id.as_str()));
        self.changed |= self
            .bigip
            .delete_if_exists(&key)
            .await
            .map_err(at(self.bigip, Step::Vip))?;
        self.released_subnets.insert(vip.subnet_id.clone());
        Ok(())
    }

    /// Tears down the device's presence on subnets that no vip or member uses any more.
    async fn release_subnets(&mut self) -> Result<(), ReconcileError> {
        let service = self.service;
        let subnets = std::mem::take(&mut self.released_subnets);
        for id in &subnets {
            let Some(subnet) = service.subnet(id) else {
                warn!(subnet = %id, "Cannot release unknown subnet");
                continue;
            };
            let network = service.subnet_network(subnet);
            self.changed |= self
                .reconciler
                .selfips
                .teardown_subnet(
                    self.bigip,
                    self.service.tenant_id(),
                    subnet,
                    network,
                    self.reconciler.config.global_routed_mode,
                )
                .await
                .map_err(at(self.bigip, Step::SubnetTeardown))?;
        }
        Ok(())
    }

    async fn teardown_partition(&mut self) -> Result<(), ReconcileError> {
        self.changed |= self
            .reconciler
            .partitions
            .teardown(self.service.tenant_id(), self.bigip)
            .await
            .map_err(at(self.bigip, Step::PartitionTeardown))?;
        Ok(())
    }
}

/// Builds the device monitor for a health monitor.
///
/// The device marks a member down after a single timeout, so the timeout covers every retry.
fn monitor_spec(name: QualifiedName, monitor: &HealthMonitor) -> MonitorSpec {
    let (send, recv) = match monitor.kind {
        MonitorType::Http | MonitorType::Https => {
            let method = monitor.http_method.as_deref().unwrap_or("GET");
            let path = monitor.url_path.as_deref().unwrap_or("/");
            (
                Some(format!("{method} {path} HTTP/1.0\\r\\n\\r\\n")),
                monitor.expected_codes.as_deref().map(expected_codes),
            )
        }
        MonitorType::Ping | MonitorType::Tcp => (None, None),
    };
    MonitorSpec {
        name,
        kind: monitor.kind,
        interval: monitor.delay,
        timeout: monitor.timeout.saturating_mul(monitor.max_retries.max(1)),
        send,
        recv,
    }
}

/// Expands an expected-codes list such as `200,202-204` into a receive pattern.
fn expected_codes(codes: &str) -> String {
    let mut expanded = Vec::new();
    for part in codes.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = part
            .split_once('-')
            .and_then(|(lo, hi)| Some((lo.trim().parse::<u16>().ok()?, hi.trim().parse::<u16>().ok()?)));
        match range {
            Some((lo, hi)) if lo <= hi => expanded.extend((lo..=hi).map(|c| c.to_string())),
            _ => expanded.push(part.to_string()),
        }
    }
    format!("HTTP/1\\.(0|1) ({})", expanded.join("|"))
}

// === impl Step ===

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partition => "partition",
            Self::Pool => "pool",
            Self::Monitor => "monitor",
            Self::MonitorAssociation => "monitor_association",
            Self::SelfIp => "self_ip",
            Self::Gateway => "gateway",
            Self::Arp => "arp",
            Self::Member => "member",
            Self::Vip => "vip",
            Self::SubnetTeardown => "subnet_teardown",
            Self::PartitionTeardown => "partition_teardown",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ReconcileReport ===

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn outcome(&self, entity: &EntityRef) -> Option<Outcome> {
        self.outcomes
            .iter()
            .find(|(e, _)| e == entity)
            .map(|(_, o)| *o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn http_monitor(expected_codes: Option<&str>) -> HealthMonitor {
        HealthMonitor {
            id: "mon-1".into(),
            kind: MonitorType::Http,
            delay: 5,
            timeout: 3,
            max_retries: 4,
            http_method: Some("HEAD".into()),
            url_path: Some("/health".into()),
            expected_codes: expected_codes.map(Into::into),
        }
    }

    #[test]
    fn http_monitors_send_requests_and_match_codes() {
        let spec = monitor_spec(
            QualifiedName::new("uuid_t", "uuid_mon-1"),
            &http_monitor(Some("200,202-204")),
        );
        assert_eq!(spec.interval, 5);
        assert_eq!(spec.timeout, 12);
        assert_eq!(spec.send.as_deref(), Some("HEAD /health HTTP/1.0\\r\\n\\r\\n"));
        assert_eq!(
            spec.recv.as_deref(),
            Some("HTTP/1\\.(0|1) (200|202|203|204)")
        );
    }

    #[test]
    fn tcp_monitors_have_no_payload() {
        let mut monitor = http_monitor(None);
        monitor.kind = MonitorType::Tcp;
        let spec = monitor_spec(QualifiedName::new("uuid_t", "uuid_mon-1"), &monitor);
        assert_eq!(spec.send, None);
        assert_eq!(spec.recv, None);
    }

    #[test]
    fn malformed_code_ranges_are_kept_verbatim() {
        assert_eq!(expected_codes("204-200, 301"), "HTTP/1\\.(0|1) (204-200|301)");
    }
}
