//! Waypoint Agent
//!
//! Registers a service node and keeps its lease alive, or watches one env
//! and reports which nodes serve a method.

use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::{debug, info, warn};
use waypoint_core::{Meta, ServiceConf, ServiceNode};
use waypoint_registry::backends::{
    etcd, ConsulApi, ConsulBackend, ConsulChangeSource, EtcdBackend, EtcdChangeSource,
    KubeBackend, KubeChangeSource,
};
use waypoint_registry::config::{normalize_consul_addr, parse_endpoints};
use waypoint_registry::observability::{init_tracing, register_metric_descriptions, TracingConfig};
use waypoint_registry::{
    BackendKind, ChangeSource, DiscoveryCache, LeaseBackend, RegistrationSession, RegistryConfig,
};

#[derive(Parser)]
#[command(name = "waypoint-agent")]
#[command(about = "Service registration and method-indexed discovery")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// Coordination backend: etcd, consul or kubernetes
    #[arg(long, global = true, env = "WAYPOINT_BACKEND", default_value = "etcd")]
    backend: BackendKind,

    /// etcd endpoints (comma-separated)
    #[arg(long, global = true, env = "ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: String,

    /// Consul agent address
    #[arg(long, global = true, env = "CONSUL_HTTP_ADDR", default_value = "http://127.0.0.1:8500")]
    consul_addr: String,

    /// Key namespace (Kubernetes namespace for the kubernetes backend)
    #[arg(long, global = true, env = "WAYPOINT_NAMESPACE", default_value = "waypoint")]
    namespace: String,

    /// Lease TTL in seconds (minimum 10)
    #[arg(long, global = true, env = "WAYPOINT_TTL", default_value_t = 10)]
    ttl: u32,

    /// Recovery attempts before giving up (minimum 3)
    #[arg(long, global = true, env = "WAYPOINT_MAX_RETRY", default_value_t = 3)]
    max_retry: u32,

    /// Externally reachable address to advertise
    #[arg(long, global = true, env = "WAYPOINT_EXTERNAL_ADDR")]
    external_addr: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a node and sustain its lease until Ctrl-C
    Register {
        #[arg(long, env = "WAYPOINT_APP_ID")]
        app_id: String,

        #[arg(long, env = "WAYPOINT_ENV")]
        env: String,

        #[arg(long, env = "WAYPOINT_VERSION", default_value = "")]
        version: String,

        /// Fully-qualified method served by this node (repeatable)
        #[arg(long = "method", required = true)]
        methods: Vec<String>,

        /// Load-balancing weight (0 publishes the default)
        #[arg(long, default_value_t = 0)]
        weight: u32,
    },
    /// Watch an env and report the nodes serving a method until Ctrl-C
    Discover {
        #[arg(long, env = "WAYPOINT_ENV")]
        env: String,

        #[arg(long)]
        method: String,

        /// Seconds between reports
        #[arg(long, default_value_t = 5)]
        every: u64,
    },
}

impl BackendArgs {
    fn service_conf(&self) -> ServiceConf {
        let mut conf = ServiceConf::new(self.namespace.clone());
        conf.ttl_seconds = self.ttl;
        conf.max_retry = self.max_retry;
        if let Some(external) = &self.external_addr {
            conf.network.external = external.clone();
        }
        conf
    }

    fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::from_env();
        config.etcd_endpoints = parse_endpoints(&self.etcd_endpoints);
        config.consul_addr = normalize_consul_addr(&self.consul_addr);
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    register_metric_descriptions();

    let conf = cli.backend.service_conf();
    let config = cli.backend.registry_config();
    info!(backend = %cli.backend.backend, namespace = %conf.namespace, "Starting waypoint-agent");

    match cli.command {
        Commands::Register {
            app_id,
            env,
            version,
            methods,
            weight,
        } => {
            let meta = Meta::new(env, app_id, version);
            let mut node = ServiceNode::with_methods(methods);
            node.weight = weight;
            match cli.backend.backend {
                BackendKind::Etcd => {
                    let client = etcd::connect(&config.etcd_endpoints, &config).await?;
                    let backend = EtcdBackend::new(client, &conf, &config);
                    run_register(backend, meta, conf, node).await
                }
                BackendKind::Consul => {
                    let backend = ConsulBackend::new(ConsulApi::new(&config)?, &conf);
                    run_register(backend, meta, conf, node).await
                }
                BackendKind::Kubernetes => {
                    let client = kube::Client::try_default().await?;
                    run_register(KubeBackend::new(client, &conf), meta, conf, node).await
                }
            }
        }
        Commands::Discover { env, method, every } => {
            let every = Duration::from_secs(every.max(1));
            match cli.backend.backend {
                BackendKind::Etcd => {
                    let client = etcd::connect(&config.etcd_endpoints, &config).await?;
                    let source = EtcdChangeSource::new(client, &conf, &env, &config);
                    run_discover(source, &env, conf, &method, every).await
                }
                BackendKind::Consul => {
                    let source =
                        ConsulChangeSource::new(ConsulApi::new(&config)?, &conf, &env, &config);
                    run_discover(source, &env, conf, &method, every).await
                }
                BackendKind::Kubernetes => {
                    let client = kube::Client::try_default().await?;
                    let source = KubeChangeSource::new(client, &conf, &env, &config);
                    run_discover(source, &env, conf, &method, every).await
                }
            }
        }
    }
}

async fn run_register<B: LeaseBackend>(
    backend: B,
    meta: Meta,
    conf: ServiceConf,
    node: ServiceNode,
) -> anyhow::Result<()> {
    let session = RegistrationSession::builder(backend, meta, conf)
        .connect()
        .await?;
    session.install(node).await?;
    info!(lease_id = ?session.lease_id().await, "Node registered");

    let mut heartbeat = {
        let session = session.clone();
        tokio::spawn(async move { session.sustain_lease().await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received Ctrl-C, deregistering");
            session.uninstall().await;
            let exit = heartbeat.await?;
            debug!(exit = ?exit, "Heartbeat stopped");
            Ok(())
        }
        exit = &mut heartbeat => {
            let exit = exit?;
            warn!(exit = ?exit, "Heartbeat stopped before shutdown");
            session.uninstall().await;
            exit.into_result()?;
            Ok(())
        }
    }
}

async fn run_discover<S: ChangeSource>(
    source: S,
    env: &str,
    conf: ServiceConf,
    method: &str,
    every: Duration,
) -> anyhow::Result<()> {
    let cache = DiscoveryCache::new(source, Meta::new(env, "", ""), conf).await?;
    info!(env = %env, nodes = cache.node_count(), "Discovery cache loaded");

    let watcher = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.watcher().await })
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("Received Ctrl-C, stopping watcher");
                break;
            }
            _ = ticker.tick() => report(&cache, method),
        }
    }

    cache.unwatch();
    watcher.await?;
    Ok(())
}

fn report<S: ChangeSource>(cache: &DiscoveryCache<S>, method: &str) {
    match cache.get_service(method) {
        Ok(nodes) => {
            for node in nodes {
                info!(
                    method = %method,
                    app_id = %node.meta.app_id,
                    version = %node.meta.version,
                    lease_id = node.lease_id,
                    address = %node.network.external,
                    weight = node.weight,
                    run_date = %node.run_date,
                    "Serving node"
                );
            }
        }
        Err(e) if e.is_not_found() => info!(method = %method, "No serving nodes"),
        Err(e) => warn!(method = %method, error = %e, "Lookup failed"),
    }
}
