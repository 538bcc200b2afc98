use ahash::AHashSet as HashSet;
use bigip_lbaas_core::{
    device::{DeviceClient, DeviceError, DeviceObject, ObjectKey},
    NetworkId, SubnetId, COMMON_FOLDER,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

/// A session with a single BIG-IP device.
///
/// Besides the client, the session owns the state the agent keeps about the device: the folder
/// context lock and the caches of network presence that has already been verified.
pub struct BigIp {
    client: Arc<dyn DeviceClient>,

    /// Held for as long as a [`FolderScope`] is alive. The device's active folder is global
    /// server-side state, so at most one scope may exist per device at a time.
    context: tokio::sync::Mutex<()>,

    /// Set when a scope was dropped without restoring `Common`.
    dirty: AtomicBool,

    assured: Mutex<Assured>,
}

#[derive(Debug, Default)]
struct Assured {
    networks: HashSet<NetworkId>,
    local_subnets: HashSet<SubnetId>,
    gateway_subnets: HashSet<SubnetId>,
}

/// Switches the device into a folder for the lifetime of the scope.
///
/// Callers must finish with [`FolderScope::exit`], which restores `Common`. If a scope is dropped
/// instead (early return or cancellation), the session is marked dirty and the next scope resets
/// the device to `Common` before doing anything else.
#[must_use = "a folder scope must be exited to restore the device's default folder"]
pub struct FolderScope<'b> {
    bigip: &'b BigIp,
    folder: String,
    restored: bool,
    _guard: tokio::sync::MutexGuard<'b, ()>,
}

// === impl BigIp ===

impl BigIp {
    pub fn new(client: Arc<dyn DeviceClient>) -> Self {
        Self {
            client,
            context: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            assured: Mutex::new(Assured::default()),
        }
    }

    pub fn hostname(&self) -> &str {
        self.client.hostname()
    }

    pub fn client(&self) -> &dyn DeviceClient {
        &*self.client
    }

    /// Makes `folder` the device's active folder until the returned scope is exited.
    ///
    /// A missing folder is created on the fly (in `traffic_group`) rather than failing.
    pub async fn enter_folder(
        &self,
        folder: &str,
        traffic_group: &str,
    ) -> Result<FolderScope<'_>, DeviceError> {
        let guard = self.context.lock().await;

        if self.dirty.swap(false, Ordering::AcqRel) {
            debug!(device = %self.hostname(), "Restoring default folder");
            if let Err(error) = self.client.set_active_folder(COMMON_FOLDER).await {
                self.dirty.store(true, Ordering::Release);
                return Err(error);
            }
        }

        if let Err(error) = self.switch_folder(folder, traffic_group).await {
            // The device may have switched partway; make sure the next scope resets it.
            self.dirty.store(true, Ordering::Release);
            return Err(error);
        }

        Ok(FolderScope {
            bigip: self,
            folder: folder.to_string(),
            restored: false,
            _guard: guard,
        })
    }

    async fn switch_folder(&self, folder: &str, traffic_group: &str) -> Result<(), DeviceError> {
        match self.client.set_active_folder(folder).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => {
                info!(device = %self.hostname(), %folder, "Creating missing folder");
                match self.client.create_folder(folder, traffic_group).await {
                    Ok(()) => {}
                    Err(error) if error.is_already_exists() => {}
                    Err(error) => return Err(error),
                }
                self.client.set_active_folder(folder).await
            }
            Err(error) => Err(error),
        }
    }

    /// Creates `object` unless it already exists. Returns true if the device was changed.
    pub async fn create_if_missing(&self, object: &DeviceObject) -> Result<bool, DeviceError> {
        if self.client.exists(&object.key()).await? {
            return Ok(false);
        }
        match self.client.create(object).await {
            Ok(()) => {
                debug!(device = %self.hostname(), key = %object.key(), "Created");
                Ok(true)
            }
            Err(error) if error.is_already_exists() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Creates `object`, or updates it in place if it already exists.
    pub async fn create_or_update(&self, object: &DeviceObject) -> Result<bool, DeviceError> {
        if self.client.exists(&object.key()).await? {
            self.client.update(object).await?;
            debug!(device = %self.hostname(), key = %object.key(), "Updated");
            return Ok(true);
        }
        match self.client.create(object).await {
            Ok(()) => {
                debug!(device = %self.hostname(), key = %object.key(), "Created");
                Ok(true)
            }
            // Raced with another writer; apply our attributes on top.
            Err(error) if error.is_already_exists() => {
                self.client.update(object).await?;
                Ok(true)
            }
            Err(error) => Err(error),
        }
    }

    /// Deletes the object named by `key` if it exists. Returns true if the device was changed.
    pub async fn delete_if_exists(&self, key: &ObjectKey) -> Result<bool, DeviceError> {
        if !self.client.exists(key).await? {
            return Ok(false);
        }
        match self.client.delete(key).await {
            Ok(()) => {
                debug!(device = %self.hostname(), %key, "Deleted");
                Ok(true)
            }
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub fn is_network_assured(&self, network: &NetworkId) -> bool {
        self.assured.lock().networks.contains(network)
    }

    pub fn assure_network(&self, network: NetworkId) {
        self.assured.lock().networks.insert(network);
    }

    pub fn is_local_subnet_assured(&self, subnet: &SubnetId) -> bool {
        self.assured.lock().local_subnets.contains(subnet)
    }

    pub fn assure_local_subnet(&self, subnet: SubnetId) {
        self.assured.lock().local_subnets.insert(subnet);
    }

    pub fn forget_local_subnet(&self, subnet: &SubnetId) {
        self.assured.lock().local_subnets.remove(subnet);
    }

    pub fn is_gateway_assured(&self, subnet: &SubnetId) -> bool {
        self.assured.lock().gateway_subnets.contains(subnet)
    }

    pub fn assure_gateway(&self, subnet: SubnetId) {
        self.assured.lock().gateway_subnets.insert(subnet);
    }

    pub fn forget_gateway(&self, subnet: &SubnetId) {
        self.assured.lock().gateway_subnets.remove(subnet);
    }

    /// Forgets all verified network presence so that it is checked against the device again.
    pub fn clear_assured(&self) {
        let mut assured = self.assured.lock();
        debug!(
            device = %self.hostname(),
            networks = assured.networks.len(),
            local_subnets = assured.local_subnets.len(),
            gateway_subnets = assured.gateway_subnets.len(),
            "Clearing assured caches"
        );
        *assured = Assured::default();
    }
}

impl std::fmt::Debug for BigIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigIp")
            .field("hostname", &self.hostname())
            .finish_non_exhaustive()
    }
}

// === impl FolderScope ===

impl FolderScope<'_> {
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Restores the device's default folder and releases the device context.
    pub async fn exit(mut self) -> Result<(), DeviceError> {
        self.bigip
            .client
            .set_active_folder(COMMON_FOLDER)
            .await?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for FolderScope<'_> {
    fn drop(&mut self) {
        if !self.restored {
            warn!(
                device = %self.bigip.hostname(),
                folder = %self.folder,
                "Folder scope dropped without restoring the default folder"
            );
            self.bigip.dirty.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for FolderScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderScope")
            .field("device", &self.bigip.hostname())
            .field("folder", &self.folder)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{Call, FakeDevice};

    #[tokio::test]
    async fn scope_restores_common() {
        let device = Arc::new(FakeDevice::new("bigip-1"));
        device.add_folder("uuid_t");
        let bigip = BigIp::new(device.clone());

        let scope = bigip.enter_folder("uuid_t", "traffic-group-1").await.unwrap();
        assert_eq!(device.active_folder(), "uuid_t");
        scope.exit().await.unwrap();
        assert_eq!(device.active_folder(), COMMON_FOLDER);
    }

    #[tokio::test]
    async fn dropped_scope_is_reset_by_next_scope() {
        let device = Arc::new(FakeDevice::new("bigip-1"));
        device.add_folder("uuid_a");
        device.add_folder("uuid_b");
        let bigip = BigIp::new(device.clone());

        drop(bigip.enter_folder("uuid_a", "tg").await.unwrap());
        assert_eq!(device.active_folder(), "uuid_a");

        device.clear_calls();
        let scope = bigip.enter_folder("uuid_b", "tg").await.unwrap();
        assert_eq!(
            device.calls(),
            vec![
                Call::SetActiveFolder(COMMON_FOLDER.to_string()),
                Call::SetActiveFolder("uuid_b".to_string()),
            ]
        );
        scope.exit().await.unwrap();
    }

    #[tokio::test]
    async fn missing_folder_is_created_on_entry() {
        let device = Arc::new(FakeDevice::new("bigip-1"));
        let bigip = BigIp::new(device.clone());

        let scope = bigip.enter_folder("uuid_new", "tg").await.unwrap();
        assert!(device.has_folder("uuid_new"));
        assert_eq!(scope.folder(), "uuid_new");
        scope.exit().await.unwrap();
    }

    #[tokio::test]
    async fn scopes_on_one_device_are_exclusive() {
        let device = Arc::new(FakeDevice::new("bigip-1"));
        device.add_folder("uuid_a");
        device.add_folder("uuid_b");
        let bigip = BigIp::new(device.clone());

        let first = bigip.enter_folder("uuid_a", "tg").await.unwrap();
        let mut second = tokio_test::task::spawn(bigip.enter_folder("uuid_b", "tg"));
        tokio_test::assert_pending!(second.poll());
        assert_eq!(device.active_folder(), "uuid_a");

        first.exit().await.unwrap();
        assert!(second.is_woken());
        let second = match second.poll() {
            std::task::Poll::Ready(scope) => scope.unwrap(),
            std::task::Poll::Pending => panic!("second scope must be admitted"),
        };
        assert_eq!(device.active_folder(), "uuid_b");
        second.exit().await.unwrap();
    }

    #[tokio::test]
    async fn scope_debug_names_device_and_folder() {
        let device = Arc::new(FakeDevice::new("bigip-1"));
        device.add_folder("uuid_t");
        let bigip = BigIp::new(device);

        let scope = bigip.enter_folder("uuid_t", "tg").await.unwrap();
        let debug = format!("{scope:?}");
        assert!(debug.contains("bigip-1"), "{debug}");
        assert!(debug.contains("uuid_t"), "{debug}");
        scope.exit().await.unwrap();
    }
}
