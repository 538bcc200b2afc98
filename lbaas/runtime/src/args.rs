use crate::{
    admin,
    core::{DeviceClient, Naming, PluginRpc, PortAllocator},
    reconcile::{
        BigIp, Cluster, HaMode, Metrics, PartitionManager, ReconcileConfig, RequestSerializer,
        SelfIpManager, ServiceReconciler, SyncConfig, SyncMode,
    },
    Agent, AgentConfig, AgentEvent,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "bigip-lbaas", about = "Applies Neutron LBaaS services to BIG-IP devices")]
pub struct Args {
    #[clap(long, default_value = "bigip_lbaas=info,warn", env = "BIGIP_LBAAS_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain", env = "BIGIP_LBAAS_LOG_FORMAT")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:9990", env = "BIGIP_LBAAS_ADMIN_ADDR")]
    admin_addr: SocketAddr,

    /// Management addresses of the devices. The first is the config device.
    #[clap(
        long,
        env = "BIGIP_LBAAS_HOSTNAMES",
        value_delimiter = ',',
        required = true
    )]
    hostnames: Vec<String>,

    /// The device group that is synced after changes.
    #[clap(long, env = "BIGIP_LBAAS_DEVICE_GROUP")]
    device_group: Option<String>,

    /// One of `standalone`, `pair` or `scalen`.
    #[clap(long, default_value = "standalone", env = "BIGIP_LBAAS_HA_MODE")]
    ha_mode: HaMode,

    /// One of `autosync` or `replication`.
    #[clap(long, default_value = "autosync", env = "BIGIP_LBAAS_SYNC_MODE")]
    sync_mode: SyncMode,

    #[clap(long, default_value = "4", env = "BIGIP_LBAAS_SYNC_ATTEMPTS")]
    sync_attempts: u32,

    #[clap(long, default_value = "130", env = "BIGIP_LBAAS_SYNC_RETRY_DELAY_SECS")]
    sync_retry_delay_secs: u64,

    /// Gives every tenant's partition its own route domain.
    #[clap(long, env = "BIGIP_LBAAS_ROUTE_DOMAIN_PER_TENANT")]
    route_domain_per_tenant: bool,

    /// Assumes tenant addresses are routed to the devices, so no self-IPs are created.
    #[clap(long, env = "BIGIP_LBAAS_GLOBAL_ROUTED_MODE")]
    global_routed_mode: bool,

    /// Creates static ARP entries for members with known MAC addresses.
    #[clap(long, env = "BIGIP_LBAAS_POPULATE_STATIC_ARP")]
    populate_static_arp: bool,

    #[clap(long, default_value = crate::core::DEFAULT_PREFIX, env = "BIGIP_LBAAS_OBJECT_PREFIX")]
    object_prefix: String,

    /// The device interface that tenant VLANs are attached to.
    #[clap(long, default_value = "1.1", env = "BIGIP_LBAAS_VLAN_INTERFACE")]
    vlan_interface: String,

    #[clap(long, default_value = "traffic-group-1", env = "BIGIP_LBAAS_TRAFFIC_GROUP")]
    traffic_group: String,

    /// Zero disables periodic flushes.
    #[clap(long, default_value = "0", env = "BIGIP_LBAAS_CACHE_FLUSH_INTERVAL_SECS")]
    cache_flush_interval_secs: u64,

    /// Zero disables statistics collection.
    #[clap(long, default_value = "600", env = "BIGIP_LBAAS_STATS_INTERVAL_SECS")]
    stats_interval_secs: u64,

    /// Must exceed the time spent waiting between sync attempts.
    #[clap(long, default_value = "900", env = "BIGIP_LBAAS_RECONCILE_TIMEOUT_SECS")]
    reconcile_timeout_secs: u64,

    #[clap(long, default_value = "1024", env = "BIGIP_LBAAS_EVENT_QUEUE_SIZE")]
    event_queue_size: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid log format: {0}")]
pub struct InvalidLogFormat(String);

/// A fully configured agent, ready to run.
pub struct Runtime {
    agent: Agent,
    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: mpsc::Receiver<AgentEvent>,
    admin_addr: SocketAddr,
    registry: Registry,
}

// === impl Args ===

impl Args {
    /// Installs the global `tracing` subscriber.
    pub fn init_log(&self) -> Result<()> {
        self.log_format.try_init(&self.log_level)
    }

    /// Connects to every device and wires the reconciliation engine together.
    pub fn build<C>(
        self,
        connect: C,
        rpc: Arc<dyn PluginRpc>,
        ports: Arc<dyn PortAllocator>,
    ) -> Result<Runtime>
    where
        C: Fn(&str) -> Result<Arc<dyn DeviceClient>>,
    {
        let Self {
            log_level: _,
            log_format: _,
            admin_addr,
            hostnames,
            device_group,
            ha_mode,
            sync_mode,
            sync_attempts,
            sync_retry_delay_secs,
            route_domain_per_tenant,
            global_routed_mode,
            populate_static_arp,
            object_prefix,
            vlan_interface,
            traffic_group,
            cache_flush_interval_secs,
            stats_interval_secs,
            reconcile_timeout_secs,
            event_queue_size,
        } = self;

        match (ha_mode, hostnames.len()) {
            (HaMode::Standalone, 1) | (HaMode::Pair, 2) => {}
            (HaMode::ScaleN, n) if n >= 2 => {}
            (mode, n) => bail!("{mode:?} clusters cannot have {n} devices"),
        }
        if sync_attempts == 0 {
            bail!("--sync-attempts must be at least 1");
        }
        let retry_budget = u64::from(sync_attempts - 1).saturating_mul(sync_retry_delay_secs);
        if reconcile_timeout_secs <= retry_budget {
            bail!(
                "--reconcile-timeout-secs ({reconcile_timeout_secs}) must exceed the {retry_budget}s spent waiting between sync attempts"
            );
        }
        if event_queue_size == 0 {
            bail!("--event-queue-size must be at least 1");
        }

        let devices = hostnames
            .iter()
            .map(|host| {
                let client = connect(host.as_str())
                    .with_context(|| format!("failed to connect to {host}"))?;
                Ok(Arc::new(BigIp::new(client)))
            })
            .collect::<Result<Vec<_>>>()?;
        let cluster = Arc::new(Cluster::new(devices, ha_mode, sync_mode, device_group));

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("lbaas"));

        let partitions =
            PartitionManager::new(Naming::new(object_prefix), route_domain_per_tenant);
        let selfips = SelfIpManager::new(
            partitions.clone(),
            ports,
            vlan_interface,
            populate_static_arp,
        );
        let reconciler = ServiceReconciler::new(
            cluster,
            partitions,
            selfips,
            SyncConfig {
                attempts: sync_attempts,
                retry_delay: Duration::from_secs(sync_retry_delay_secs),
            },
            ReconcileConfig {
                global_routed_mode,
                traffic_group,
            },
            metrics.clone(),
        );

        let agent = Agent::new(
            reconciler,
            rpc,
            RequestSerializer::new(metrics.serializer_waiters()),
            AgentConfig {
                stats_interval: secs(stats_interval_secs),
                cache_flush_interval: secs(cache_flush_interval_secs),
                reconcile_timeout: Duration::from_secs(reconcile_timeout_secs),
            },
        );

        let (events_tx, events_rx) = mpsc::channel(event_queue_size);
        Ok(Runtime {
            agent,
            events_tx,
            events_rx,
            admin_addr,
            registry: prom,
        })
    }
}

fn secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// === impl LogFormat ===

impl LogFormat {
    fn try_init(self, filter: &str) -> Result<()> {
        let filter = EnvFilter::try_new(filter)?;
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self {
            Self::Plain => builder.try_init(),
            Self::Json => builder.json().try_init(),
        }
        .map_err(|error| anyhow::anyhow!("failed to initialize logging: {error}"))
    }
}

impl FromStr for LogFormat {
    type Err = InvalidLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(InvalidLogFormat(s.to_string())),
        }
    }
}

// === impl Runtime ===

impl Runtime {
    /// A handle for submitting events to the agent.
    pub fn events(&self) -> mpsc::Sender<AgentEvent> {
        self.events_tx.clone()
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Runs the agent and the admin server until a shutdown signal, or until every event sender
    /// has been dropped, and then waits for in-flight events to complete.
    pub async fn run(self) -> Result<()> {
        let Self {
            agent,
            events_tx,
            events_rx,
            admin_addr,
            registry,
        } = self;
        drop(events_tx);

        let listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin server on {admin_addr}"))?;
        let admin_addr = listener.local_addr()?;

        let (signal, drain) = drain::channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        tokio::spawn(
            admin::serve(listener, admin_addr, ready_rx, Arc::new(registry), drain.clone())
                .instrument(info_span!("admin")),
        );
        let mut agent = tokio::spawn(agent.run(events_rx, drain).instrument(info_span!("agent")));

        ready_tx.send_replace(true);
        info!(%admin_addr, "Agent started");

        tokio::select! {
            res = shutdown_signal() => {
                res?;
                info!("Received shutdown signal");
            }
            _ = &mut agent => info!("Event channel closed"),
        }

        ready_tx.send_replace(false);
        signal.drain().await;
        info!("Shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::fake::{FakeDevice, FakePorts};

    struct NoRpc;

    #[async_trait::async_trait]
    impl PluginRpc for NoRpc {
        async fn get_service(&self, pool: &crate::core::PoolId) -> Result<serde_json::Value> {
            bail!("unexpected request for {pool}")
        }
        async fn update_pool_status(
            &self,
            _: &crate::core::PoolId,
            _: crate::core::Status,
        ) -> Result<()> {
            Ok(())
        }
        async fn pool_destroyed(&self, _: &crate::core::PoolId) -> Result<()> {
            Ok(())
        }
        async fn update_member_status(
            &self,
            _: &crate::core::MemberId,
            _: crate::core::Status,
        ) -> Result<()> {
            Ok(())
        }
        async fn member_destroyed(&self, _: &crate::core::MemberId) -> Result<()> {
            Ok(())
        }
        async fn update_vip_status(
            &self,
            _: &crate::core::VipId,
            _: crate::core::Status,
        ) -> Result<()> {
            Ok(())
        }
        async fn vip_destroyed(&self, _: &crate::core::VipId) -> Result<()> {
            Ok(())
        }
        async fn update_health_monitor_status(
            &self,
            _: &crate::core::PoolId,
            _: &crate::core::MonitorId,
            _: crate::core::Status,
        ) -> Result<()> {
            Ok(())
        }
        async fn health_monitor_destroyed(
            &self,
            _: &crate::core::PoolId,
            _: &crate::core::MonitorId,
        ) -> Result<()> {
            Ok(())
        }
        async fn update_pool_stats(
            &self,
            _: &crate::core::PoolId,
            _: crate::core::device::PoolStats,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn build(args: &[&str]) -> Result<Runtime> {
        let args =
            Args::try_parse_from(std::iter::once("bigip-lbaas").chain(args.iter().copied()))?;
        args.build(
            |host| Ok(Arc::new(FakeDevice::new(host)) as Arc<dyn DeviceClient>),
            Arc::new(NoRpc),
            Arc::new(FakePorts::new(std::iter::empty())),
        )
    }

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["bigip-lbaas", "--hostnames", "10.0.0.1"]).unwrap();
        assert_eq!(args.hostnames, vec!["10.0.0.1".to_string()]);
        assert_eq!(args.ha_mode, HaMode::Standalone);
        assert_eq!(args.sync_mode, SyncMode::AutoSync);
        assert_eq!(args.sync_attempts, 4);
        assert_eq!(args.sync_retry_delay_secs, 130);
        assert_eq!(args.object_prefix, "uuid_");
        assert_eq!(args.log_format, LogFormat::Plain);
        assert!(!args.route_domain_per_tenant);
    }

    #[test]
    fn parses_cluster_options() {
        let args = Args::try_parse_from([
            "bigip-lbaas",
            "--hostnames",
            "10.0.0.1,10.0.0.2",
            "--ha-mode",
            "pair",
            "--sync-mode",
            "replication",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.hostnames.len(), 2);
        assert_eq!(args.ha_mode, HaMode::Pair);
        assert_eq!(args.sync_mode, SyncMode::Replication);
        assert_eq!(args.log_format, LogFormat::Json);

        assert!(Args::try_parse_from(["bigip-lbaas", "--hostnames", "a", "--ha-mode", "cluster"])
            .is_err());
        assert!(Args::try_parse_from(["bigip-lbaas"]).is_err());
    }

    #[test]
    fn device_count_must_match_ha_mode() {
        assert!(build(&["--hostnames", "a"]).is_ok());
        assert!(build(&["--hostnames", "a,b"]).is_err());
        assert!(build(&["--hostnames", "a,b", "--ha-mode", "pair"]).is_ok());
        assert!(build(&["--hostnames", "a,b,c", "--ha-mode", "pair"]).is_err());
        assert!(build(&["--hostnames", "a,b,c", "--ha-mode", "scalen"]).is_ok());
        assert!(build(&["--hostnames", "a", "--sync-attempts", "0"]).is_err());
    }

    #[test]
    fn reconcile_timeout_must_cover_sync_retries() {
        // Three waits of 130s between the default four attempts.
        assert!(build(&["--hostnames", "a", "--reconcile-timeout-secs", "391"]).is_ok());
        let error = build(&["--hostnames", "a", "--reconcile-timeout-secs", "390"])
            .err()
            .expect("timeout must be rejected");
        assert!(error.to_string().contains("390s"), "{error}");

        assert!(build(&[
            "--hostnames",
            "a",
            "--reconcile-timeout-secs",
            "60",
            "--sync-attempts",
            "2",
            "--sync-retry-delay-secs",
            "30",
        ])
        .is_ok());
        assert!(build(&[
            "--hostnames",
            "a",
            "--reconcile-timeout-secs",
            "60",
            "--sync-attempts",
            "1",
            "--sync-retry-delay-secs",
            "3600",
        ])
        .is_ok());
    }

    #[test]
    fn connection_failures_name_the_device() {
        let args = Args::try_parse_from(["bigip-lbaas", "--hostnames", "10.0.0.9"]).unwrap();
        let error = args
            .build(
                |_| bail!("connection refused"),
                Arc::new(NoRpc),
                Arc::new(FakePorts::new(std::iter::empty())),
            )
            .err()
            .expect("connection must fail");
        assert_eq!(error.to_string(), "failed to connect to 10.0.0.9");
    }

    #[test]
    fn registers_metrics() {
        let runtime = build(&["--hostnames", "a"]).unwrap();
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &runtime.registry).unwrap();
        assert!(out.contains("lbaas_serializer_waiters"), "{out}");
    }
}
