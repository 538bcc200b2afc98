//! In-memory devices and port allocators for tests.
//!
//! [`FakeDevice`] enforces the referential rules a real BIG-IP enforces (members need their pool,
//! referenced monitors and pools cannot be deleted, non-empty folders cannot be deleted, route
//! domains are created from within their folder) and records every call it receives.

use ahash::AHashMap as HashMap;
use bigip_lbaas_core::{
    device::{
        DeviceClient, DeviceError, DeviceObject, ObjectKey, ObjectKind, PoolStats,
        VirtualServerKind,
    },
    rpc::{Port, PortAllocator},
    IpNet, QualifiedName, SubnetId, COMMON_FOLDER,
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, net::IpAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    FolderExists(String),
    ListFolders,
    CreateFolder(String),
    DeleteFolder(String),
    PurgeFolder(String),
    SetActiveFolder(String),
    RouteDomainId(String),
    CreateRouteDomain(String),
    DeleteRouteDomain(String),
    Exists(ObjectKey),
    Create(ObjectKey),
    Update(ObjectKey),
    Delete(ObjectKey),
    List(ObjectKind, String),
    PoolMonitors(QualifiedName),
    SetPoolMonitors(QualifiedName, Vec<QualifiedName>),
    SelfIpTrafficGroup(QualifiedName),
    FolderAddresses(String),
    Sync { group: String, force_now: bool },
    PoolStats(QualifiedName),
}

type Matcher = Box<dyn Fn(&Call) -> bool + Send + Sync>;

pub struct FakeDevice {
    hostname: String,
    state: Mutex<State>,
}

struct State {
    folders: BTreeSet<String>,
    active_folder: String,
    route_domains: HashMap<String, u16>,
    next_route_domain: u16,
    objects: HashMap<ObjectKey, DeviceObject>,
    pool_monitors: HashMap<QualifiedName, Vec<QualifiedName>>,
    traffic_groups: HashMap<QualifiedName, String>,
    stats: HashMap<QualifiedName, PoolStats>,
    calls: Vec<Call>,
    faults: Vec<(Matcher, DeviceError)>,
    sync_failures: usize,
}

/// Hands out addresses from each subnet, starting at the tenth host.
#[derive(Default)]
pub struct FakePorts {
    subnets: Mutex<HashMap<SubnetId, IpNet>>,
    ports: Mutex<Vec<Port>>,
}

// === impl Call ===

impl Call {
    /// Calls that change device state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateFolder(_)
                | Self::DeleteFolder(_)
                | Self::PurgeFolder(_)
                | Self::CreateRouteDomain(_)
                | Self::DeleteRouteDomain(_)
                | Self::Create(_)
                | Self::Update(_)
                | Self::Delete(_)
                | Self::SetPoolMonitors(..)
                | Self::Sync { .. }
        )
    }
}

// === impl FakeDevice ===

impl FakeDevice {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: Mutex::new(State {
                folders: std::iter::once(COMMON_FOLDER.to_string()).collect(),
                active_folder: COMMON_FOLDER.to_string(),
                route_domains: HashMap::new(),
                next_route_domain: 1,
                objects: HashMap::new(),
                pool_monitors: HashMap::new(),
                traffic_groups: HashMap::new(),
                stats: HashMap::new(),
                calls: Vec::new(),
                faults: Vec::new(),
                sync_failures: 0,
            }),
        }
    }

    pub fn add_folder(&self, folder: &str) {
        self.state.lock().folders.insert(folder.to_string());
    }

    pub fn has_folder(&self, folder: &str) -> bool {
        self.state.lock().folders.contains(folder)
    }

    pub fn active_folder(&self) -> String {
        self.state.lock().active_folder.clone()
    }

    pub fn has_route_domain(&self, folder: &str) -> bool {
        self.state.lock().route_domains.contains_key(folder)
    }

    /// Places an object on the device without recording a call.
    pub fn insert(&self, object: DeviceObject) {
        let mut state = self.state.lock();
        if let DeviceObject::SelfIp(spec) = &object {
            state
                .traffic_groups
                .entry(spec.name.clone())
                .or_insert_with(|| spec.traffic_group.clone());
        }
        state.objects.insert(object.key(), object);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<DeviceObject> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    pub fn objects(&self, kind: ObjectKind) -> Vec<DeviceObject> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind() == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn monitors_of(&self, pool: &QualifiedName) -> Vec<QualifiedName> {
        self.state
            .lock()
            .pool_monitors
            .get(pool)
            .cloned()
            .unwrap_or_default()
    }

    /// Overrides the traffic group the device reports for a self-IP.
    pub fn set_traffic_group(&self, name: QualifiedName, traffic_group: &str) {
        self.state
            .lock()
            .traffic_groups
            .insert(name, traffic_group.to_string());
    }

    pub fn set_stats(&self, pool: QualifiedName, stats: PoolStats) {
        self.state.lock().stats.insert(pool, stats);
    }

    /// Fails the next call matching `matcher` with `error`.
    pub fn fail_next(
        &self,
        matcher: impl Fn(&Call) -> bool + Send + Sync + 'static,
        error: DeviceError,
    ) {
        self.state.lock().faults.push((Box::new(matcher), error));
    }

    /// Fails the next `n` device-group syncs.
    pub fn fail_syncs(&self, n: usize) {
        self.state.lock().sync_failures = n;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Records a call and returns the injected fault for it, if any.
    fn record(&self, call: Call) -> Result<parking_lot::MutexGuard<'_, State>, DeviceError> {
        let mut state = self.state.lock();
        let fault = state.faults.iter().position(|(m, _)| m(&call));
        state.calls.push(call);
        if let Some(idx) = fault {
            let (_, error) = state.faults.remove(idx);
            return Err(error);
        }
        Ok(state)
    }
}

impl State {
    fn folder_is_empty(&self, folder: &str) -> bool {
        !self.objects.keys().any(|k| k.folder() == folder)
            && !self.route_domains.contains_key(folder)
    }

    fn pool_is_referenced(&self, pool: &QualifiedName) -> bool {
        self.objects.values().any(|o| match o {
            DeviceObject::VirtualServer(vs) => vs.pool.as_ref() == Some(pool),
            _ => false,
        })
    }

    fn monitor_is_referenced(&self, monitor: &QualifiedName) -> bool {
        self.pool_monitors.values().any(|ms| ms.contains(monitor))
    }

    fn remove_pool(&mut self, pool: &QualifiedName) {
        self.objects.retain(|k, _| match k {
            ObjectKey::Member { pool: p, .. } => p != pool,
            _ => true,
        });
        self.pool_monitors.remove(pool);
    }
}

#[async_trait::async_trait]
impl DeviceClient for FakeDevice {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn folder_exists(&self, folder: &str) -> Result<bool, DeviceError> {
        let state = self.record(Call::FolderExists(folder.to_string()))?;
        Ok(state.folders.contains(folder))
    }

    async fn list_folders(&self) -> Result<Vec<String>, DeviceError> {
        let state = self.record(Call::ListFolders)?;
        Ok(state.folders.iter().cloned().collect())
    }

    async fn create_folder(&self, folder: &str, _traffic_group: &str) -> Result<(), DeviceError> {
        let mut state = self.record(Call::CreateFolder(folder.to_string()))?;
        if !state.folders.insert(folder.to_string()) {
            return Err(DeviceError::AlreadyExists(folder.to_string()));
        }
        Ok(())
    }

    async fn delete_folder(&self, folder: &str) -> Result<(), DeviceError> {
        let mut state = self.record(Call::DeleteFolder(folder.to_string()))?;
        if !state.folders.contains(folder) {
            return Err(DeviceError::NotFound(folder.to_string()));
        }
        if state.active_folder == folder {
            return Err(DeviceError::InUse(folder.to_string()));
        }
        if !state.folder_is_empty(folder) {
            return Err(DeviceError::NotEmpty(folder.to_string()));
        }
        state.folders.remove(folder);
        Ok(())
    }

    async fn purge_folder(&self, folder: &str) -> Result<(), DeviceError> {
        let mut state = self.record(Call::PurgeFolder(folder.to_string()))?;
        state.objects.retain(|k, _| k.folder() != folder);
        state.pool_monitors.retain(|p, _| p.folder != folder);
        state.route_domains.remove(folder);
        Ok(())
    }

    async fn set_active_folder(&self, folder: &str) -> Result<(), DeviceError> {
        let mut state = self.record(Call::SetActiveFolder(folder.to_string()))?;
        if !state.folders.contains(folder) {
            return Err(DeviceError::NotFound(folder.to_string()));
        }
        state.active_folder = folder.to_string();
        Ok(())
    }

    async fn route_domain_id(&self, folder: &str) -> Result<Option<u16>, DeviceError> {
        let state = self.record(Call::RouteDomainId(folder.to_string()))?;
        Ok(state.route_domains.get(folder).copied())
    }

    async fn create_route_domain(&self, folder: &str) -> Result<u16, DeviceError> {
        let mut state = self.record(Call::CreateRouteDomain(folder.to_string()))?;
        if state.active_folder != folder {
            return Err(DeviceError::Unknown(format!(
                "route domain for {folder} created from folder {}",
                state.active_folder
            )));
        }
        if state.route_domains.contains_key(folder) {
            return Err(DeviceError::AlreadyExists(format!("route domain {folder}")));
        }
        let id = state.next_route_domain;
        state.next_route_domain += 1;
        state.route_domains.insert(folder.to_string(), id);
        Ok(id)
    }

    async fn delete_route_domain(&self, folder: &str) -> Result<(), DeviceError> {
        let mut state = self.record(Call::DeleteRouteDomain(folder.to_string()))?;
        if state.active_folder != folder {
            return Err(DeviceError::Unknown(format!(
                "route domain for {folder} deleted from folder {}",
                state.active_folder
            )));
        }
        match state.route_domains.remove(folder) {
            Some(_) => Ok(()),
            None => Err(DeviceError::NotFound(format!("route domain {folder}"))),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> Result<bool, DeviceError> {
        let state = self.record(Call::Exists(key.clone()))?;
        Ok(state.objects.contains_key(key))
    }

    async fn create(&self, object: &DeviceObject) -> Result<(), DeviceError> {
        let key = object.key();
        let mut state = self.record(Call::Create(key.clone()))?;
        if !state.folders.contains(key.folder()) {
            return Err(DeviceError::NotFound(format!("folder {}", key.folder())));
        }
        if state.objects.contains_key(&key) {
            return Err(DeviceError::AlreadyExists(key.to_string()));
        }
        if let ObjectKey::Member { pool, .. } = &key {
            if !state.objects.contains_key(&ObjectKey::Pool(pool.clone())) {
                return Err(DeviceError::NotFound(format!("pool {pool}")));
            }
        }
        if let DeviceObject::SelfIp(spec) = object {
            state
                .traffic_groups
                .entry(spec.name.clone())
                .or_insert_with(|| spec.traffic_group.clone());
        }
        state.objects.insert(key, object.clone());
        Ok(())
    }

    async fn update(&self, object: &DeviceObject) -> Result<(), DeviceError> {
        let key = object.key();
        let mut state = self.record(Call::Update(key.clone()))?;
        match state.objects.get_mut(&key) {
            Some(existing) => {
                *existing = object.clone();
                Ok(())
            }
            None => Err(DeviceError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), DeviceError> {
        let mut state = self.record(Call::Delete(key.clone()))?;
        if !state.objects.contains_key(key) {
            return Err(DeviceError::NotFound(key.to_string()));
        }
        match key {
            ObjectKey::Pool(pool) => {
                if state.pool_is_referenced(pool) {
                    return Err(DeviceError::InUse(key.to_string()));
                }
                state.remove_pool(pool);
            }
            ObjectKey::Monitor(monitor) if state.monitor_is_referenced(monitor) => {
                return Err(DeviceError::InUse(key.to_string()));
            }
            ObjectKey::SelfIp(name) => {
                state.traffic_groups.remove(name);
            }
            _ => {}
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn list(&self, kind: ObjectKind, folder: &str) -> Result<Vec<String>, DeviceError> {
        let state = self.record(Call::List(kind, folder.to_string()))?;
        let mut names = state
            .objects
            .keys()
            .filter(|k| k.kind() == kind && k.folder() == folder)
            .map(|k| k.to_string())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    async fn pool_monitors(
        &self,
        pool: &QualifiedName,
    ) -> Result<Vec<QualifiedName>, DeviceError> {
        let state = self.record(Call::PoolMonitors(pool.clone()))?;
        if !state.objects.contains_key(&ObjectKey::Pool(pool.clone())) {
            return Err(DeviceError::NotFound(format!("pool {pool}")));
        }
        Ok(state.pool_monitors.get(pool).cloned().unwrap_or_default())
    }

    async fn set_pool_monitors(
        &self,
        pool: &QualifiedName,
        monitors: &[QualifiedName],
    ) -> Result<(), DeviceError> {
        let mut state = self.record(Call::SetPoolMonitors(pool.clone(), monitors.to_vec()))?;
        if !state.objects.contains_key(&ObjectKey::Pool(pool.clone())) {
            return Err(DeviceError::NotFound(format!("pool {pool}")));
        }
        if let Some(missing) = monitors
            .iter()
            .find(|m| !state.objects.contains_key(&ObjectKey::Monitor((*m).clone())))
        {
            return Err(DeviceError::NotFound(format!("monitor {missing}")));
        }
        state.pool_monitors.insert(pool.clone(), monitors.to_vec());
        Ok(())
    }

    async fn self_ip_traffic_group(&self, name: &QualifiedName) -> Result<String, DeviceError> {
        let state = self.record(Call::SelfIpTrafficGroup(name.clone()))?;
        state
            .traffic_groups
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(format!("self-ip {name}")))
    }

    async fn folder_addresses(&self, folder: &str) -> Result<Vec<IpAddr>, DeviceError> {
        let state = self.record(Call::FolderAddresses(folder.to_string()))?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.folder() == folder)
            .filter_map(|(_, o)| match o {
                DeviceObject::VirtualServer(vs) if vs.kind == VirtualServerKind::Standard => {
                    Some(vs.destination.ip)
                }
                DeviceObject::Member(m) => Some(m.address.ip),
                _ => None,
            })
            .collect())
    }

    async fn sync_device_group(&self, group: &str, force_now: bool) -> Result<(), DeviceError> {
        let mut state = self.record(Call::Sync {
            group: group.to_string(),
            force_now,
        })?;
        if state.sync_failures > 0 {
            state.sync_failures -= 1;
            return Err(DeviceError::Unknown(format!("sync of {group} failed")));
        }
        Ok(())
    }

    async fn pool_stats(&self, pool: &QualifiedName) -> Result<PoolStats, DeviceError> {
        let state = self.record(Call::PoolStats(pool.clone()))?;
        if !state.objects.contains_key(&ObjectKey::Pool(pool.clone())) {
            return Err(DeviceError::NotFound(format!("pool {pool}")));
        }
        Ok(state.stats.get(pool).copied().unwrap_or_default())
    }
}

// === impl FakePorts ===

impl FakePorts {
    pub fn new(subnets: impl IntoIterator<Item = (SubnetId, IpNet)>) -> Self {
        Self {
            subnets: Mutex::new(subnets.into_iter().collect()),
            ports: Mutex::new(Vec::new()),
        }
    }

    pub fn ports(&self) -> Vec<Port> {
        self.ports.lock().clone()
    }
}

#[async_trait::async_trait]
impl PortAllocator for FakePorts {
    async fn get_port_by_name(&self, name: &str) -> anyhow::Result<Option<Port>> {
        Ok(self.ports.lock().iter().find(|p| p.name == name).cloned())
    }

    async fn create_port_on_subnet(&self, subnet: &SubnetId, name: &str) -> anyhow::Result<Port> {
        let cidr = self
            .subnets
            .lock()
            .get(subnet)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown subnet {subnet}"))?;
        let mut ports = self.ports.lock();
        let taken = ports.iter().filter(|p| &p.subnet_id == subnet).count();
        let fixed_ip = cidr
            .hosts()
            .nth(9 + taken)
            .ok_or_else(|| anyhow::anyhow!("subnet {subnet} is exhausted"))?;
        let port = Port {
            name: name.to_string(),
            subnet_id: subnet.clone(),
            fixed_ip,
        };
        ports.push(port.clone());
        Ok(port)
    }

    async fn delete_port_by_name(&self, name: &str) -> anyhow::Result<()> {
        self.ports.lock().retain(|p| p.name != name);
        Ok(())
    }
}
