use crate::core::{payload, EntityRef, PluginRpc, PoolId, Status, TenantId};
use crate::reconcile::{Outcome, RequestSerializer, ServiceReconciler};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};
use tracing::{debug, info, info_span, warn, Instrument};


/// Work the agent is asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentEvent {
    /// The plugin changed some part of the pool's service.
    ServiceChanged { pool_id: PoolId },

    /// Posts the pool's traffic statistics to the plugin.
    CollectStats { pool_id: PoolId },

    /// Forgets which networks, self-IPs and gateways are known to exist on the devices.
    FlushCaches,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// How often statistics are collected for every reconciled pool. `None` disables collection.
    pub stats_interval: Option<Duration>,

    /// `None` keeps cached device state until an explicit flush.
    pub cache_flush_interval: Option<Duration>,

    pub reconcile_timeout: Duration,
}

/// Drives reconciliation from plugin events.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    reconciler: ServiceReconciler,
    rpc: Arc<dyn PluginRpc>,
    serializer: RequestSerializer<PoolId>,
    config: AgentConfig,

    /// Pools known to exist on the devices, with their owning tenant.
    tracked: Mutex<HashMap<PoolId, TenantId>>,
}

// === impl Agent ===

impl Agent {
    pub fn new(
        reconciler: ServiceReconciler,
        rpc: Arc<dyn PluginRpc>,
        serializer: RequestSerializer<PoolId>,
        config: AgentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                rpc,
                serializer,
                config,
                tracked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn tracked_pools(&self) -> Vec<PoolId> {
        let mut pools = self.inner.tracked.lock().keys().cloned().collect::<Vec<_>>();
        pools.sort();
        pools
    }

    pub async fn handle(&self, event: AgentEvent) -> Result<()> {
        match event {
            AgentEvent::ServiceChanged { pool_id } => self.service_changed(&pool_id).await,
            AgentEvent::CollectStats { pool_id } => self.collect_stats(&pool_id).await,
            AgentEvent::FlushCaches => {
                self.flush_caches();
                Ok(())
            }
        }
    }

    /// Pulls the pool's service from the plugin, applies it, and reports the outcome of every
    /// entity that completed on all devices.
    ///
    /// Entities that failed are not reported, so they remain pending in the plugin.
    pub async fn service_changed(&self, pool: &PoolId) -> Result<()> {
        let _ticket = self.inner.serializer.admit(pool.clone()).await;

        let payload = self.inner.rpc.get_service(pool).await?;
        let Some(service) = payload::decode(payload)? else {
            debug!("Pool no longer exists");
            self.inner.tracked.lock().remove(pool);
            return Ok(());
        };
        let tenant = service.tenant_id().clone();

        let timeout = self.inner.config.reconcile_timeout;
        let report = match time::timeout(timeout, self.inner.reconciler.reconcile(service)).await
        {
            Ok(res) => res?,
            Err(_) => bail!("reconciliation did not complete within {timeout:?}"),
        };

        for (entity, outcome) in &report.outcomes {
            if let Err(error) = self.notify(entity, *outcome).await {
                warn!(?entity, %error, "Failed to notify the plugin");
            }
        }

        match report.outcome(&EntityRef::Pool(pool.clone())) {
            Some(Outcome::Destroyed) => {
                self.inner.tracked.lock().remove(pool);
            }
            Some(Outcome::Active) => {
                self.inner.tracked.lock().insert(pool.clone(), tenant);
            }
            None => {}
        }

        if report.is_complete() {
            info!(entities = report.outcomes.len(), "Reconciled service");
        } else {
            for error in &report.errors {
                warn!(device = %error.device, step = %error.step, error = %error.source, "Service is incomplete");
            }
        }
        Ok(())
    }

    async fn notify(&self, entity: &EntityRef, outcome: Outcome) -> Result<()> {
        let rpc = &*self.inner.rpc;
        match (entity, outcome) {
            (EntityRef::Pool(id), Outcome::Active) => {
                rpc.update_pool_status(id, Status::Active).await
            }
            (EntityRef::Pool(id), Outcome::Destroyed) => rpc.pool_destroyed(id).await,
            (EntityRef::Member(id), Outcome::Active) => {
                rpc.update_member_status(id, Status::Active).await
            }
            (EntityRef::Member(id), Outcome::Destroyed) => rpc.member_destroyed(id).await,
            (EntityRef::Vip(id), Outcome::Active) => {
                rpc.update_vip_status(id, Status::Active).await
            }
            (EntityRef::Vip(id), Outcome::Destroyed) => rpc.vip_destroyed(id).await,
            (EntityRef::Monitor { pool, monitor }, Outcome::Active) => {
                rpc.update_health_monitor_status(pool, monitor, Status::Active)
                    .await
            }
            (EntityRef::Monitor { pool, monitor }, Outcome::Destroyed) => {
                rpc.health_monitor_destroyed(pool, monitor).await
            }
        }
    }

    /// Reads the pool's statistics from the devices and posts them to the plugin.
    pub async fn collect_stats(&self, pool: &PoolId) -> Result<()> {
        let _ticket = self.inner.serializer.admit(pool.clone()).await;

        let tracked = self.inner.tracked.lock().get(pool).cloned();
        let tenant = match tracked {
            Some(tenant) => tenant,
            None => {
                let payload = self.inner.rpc.get_service(pool).await?;
                match payload::decode(payload)? {
                    Some(service) => service.tenant_id().clone(),
                    None => return Ok(()),
                }
            }
        };

        match self.inner.reconciler.pool_stats(&tenant, pool).await? {
            Some(stats) => self.inner.rpc.update_pool_stats(pool, stats).await,
            None => {
                debug!("Pool does not exist on the devices");
                Ok(())
            }
        }
    }

    pub fn flush_caches(&self) {
        debug!("Flushing device caches");
        self.inner.reconciler.clear_caches();
    }

    /// Handles events until the channel closes or shutdown is signaled.
    ///
    /// Each event runs on its own task, which holds the drain open until it completes.
    pub async fn run(self, mut events: mpsc::Receiver<AgentEvent>, drain: drain::Watch) {
        let config = &self.inner.config;
        let mut stats = config.stats_interval.filter(|p| !p.is_zero()).map(interval);
        let mut flush = config
            .cache_flush_interval
            .filter(|p| !p.is_zero())
            .map(interval);

        tokio::pin! {
            let shutdown = drain.clone().signaled();
        }
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.spawn(event, drain.clone()),
                    None => {
                        debug!("Event channel closed");
                        return;
                    }
                },

                () = tick(&mut stats) => {
                    for pool_id in self.tracked_pools() {
                        self.spawn(AgentEvent::CollectStats { pool_id }, drain.clone());
                    }
                }

                () = tick(&mut flush) => self.flush_caches(),

                release = &mut shutdown => {
                    debug!("Shutdown signaled");
                    drop(release);
                    return;
                }
            }
        }
    }

    fn spawn(&self, event: AgentEvent, watch: drain::Watch) {
        let span = match &event {
            AgentEvent::ServiceChanged { pool_id } => info_span!("service", pool = %pool_id),
            AgentEvent::CollectStats { pool_id } => info_span!("stats", pool = %pool_id),
            AgentEvent::FlushCaches => info_span!("flush"),
        };
        let agent = self.clone();
        tokio::spawn(
            async move {
                if let Err(error) = agent.handle(event).await {
                    warn!(error = %format_args!("{error:#}"), "Failed to handle event");
                }
                drop(watch);
            }
            .instrument(span),
        );
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("reconciler", &self.inner.reconciler)
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.tracked.lock().len())
            .finish()
    }
}

fn interval(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
