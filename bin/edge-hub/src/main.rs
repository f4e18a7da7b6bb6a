use anyhow::{Context, Result};
use hub_cache::gc::ObjectExistence;
use hub_cache::{CacheAgents, CacheManager, DiskStore, StorageWrapper};
use hub_certs::{CertManagerConfig, HttpCertificateApi, HubCertificateManager};
use hub_core::config::LogConfig;
use hub_core::{CertificateManager, HubConfig, RemoteServer};
use hub_filter::{FilterManager, FilterRegistry, FilterSettings};
use hub_proxy::transport::DEFAULT_CONNECT_TIMEOUT;
use hub_proxy::{
    build_chain, AdminHandler, ApiClient, CachedServiceResolver, HealthCheckConfig, HealthChecker, HealthGate,
    HubHandler, LeaseClient, LeaseHealthChecker, LoadBalancer, LocalProxy, MetricsCollector, RemoteObjectExistence,
    RemoteProxy, TlsServerConfig, TransportManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod server;
mod tasks;

const DEFAULT_CONFIG_PATH: &str = "/etc/edge-hub/config.yaml";

/// How often pooled connections are checked against the active client certificate
const CERT_WATCH_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("EDGE_HUB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = HubConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    config.validate()?;

    init_logging(&config.log);
    info!(node = %config.node_name, "Starting edge-hub with {} remote servers", config.servers.len());

    let metrics = MetricsCollector::new()?;

    // Client identity
    let certs = Arc::new(HubCertificateManager::new(
        CertManagerConfig::from_hub(&config),
        Arc::new(HttpCertificateApi::new(config.request_timeout())),
    ));
    certs.start().await.context("obtaining client certificate")?;
    let cert_manager: Arc<dyn CertificateManager> = certs.clone();

    let transports = Arc::new(TransportManager::new(cert_manager.clone(), DEFAULT_CONNECT_TIMEOUT)?);
    let api = Arc::new(ApiClient::new(transports.clone(), config.request_timeout()));

    let servers = config
        .servers
        .iter()
        .map(|url| RemoteServer::new(url, config.health.healthy_threshold).map(Arc::new))
        .collect::<hub_core::Result<Vec<_>>>()?;

    let cache = if config.enable_caching {
        let store = DiskStore::new(&config.cache_dir)
            .await
            .with_context(|| format!("opening cache at {}", config.cache_dir.display()))?;
        let storage = Arc::new(StorageWrapper::new(Arc::new(store)));
        let agents = Arc::new(CacheAgents::new(&config.cache_agents));
        let cache = Arc::new(CacheManager::load(storage, agents).await?);
        info!("Object cache enabled at {}", config.cache_dir.display());
        Some(cache)
    } else {
        warn!("Object cache disabled, local fallback serves nothing");
        None
    };

    let leases: Arc<dyn LeaseClient> = api.clone();
    let checker = Arc::new(
        LeaseHealthChecker::new(
            HealthCheckConfig::from_hub(&config),
            servers.clone(),
            leases,
            transports.clone(),
            metrics.clone(),
        )
        .await,
    );
    let health: Arc<dyn HealthChecker> = checker.clone();

    // Filters
    let resolver = Arc::new(CachedServiceResolver::new(
        cache.clone(),
        api.clone(),
        servers.clone(),
        health.clone(),
    ));
    let registry = FilterRegistry::with_defaults(resolver)?;
    let secure_addr = server::parse_addr(&config.proxy_secure_address)?;
    let (master_host, master_port) = server::master_endpoint(secure_addr, config.dummy_if_ip);
    let settings = FilterSettings {
        node_name: config.node_name.clone(),
        node_pool: config.node_pool.clone(),
        master_host,
        master_port,
    };
    let filters = Arc::new(FilterManager::new(&registry, &settings, &config.filters.disabled)?);
    info!("Filters enabled: {:?}", filters.names());

    // Routing
    let backends = servers
        .iter()
        .map(|server| {
            Arc::new(RemoteProxy::new(
                server.clone(),
                transports.clone(),
                cache.clone(),
                filters.clone(),
                metrics.clone(),
            ))
        })
        .collect();
    let lb = Arc::new(LoadBalancer::new(backends, config.lb_mode, health.clone(), cert_manager));
    let gate: Arc<dyn HealthGate> = lb.clone();
    let local = Arc::new(LocalProxy::new(cache.clone(), gate.clone(), metrics.clone()));
    let chain = Arc::new(build_chain(&config, &metrics));
    info!("Middleware chain: {:?}", chain.names());
    let handler = Arc::new(HubHandler::new(chain, lb.clone(), local, health.clone(), metrics.clone()));
    let admin = Arc::new(AdminHandler::new(gate.clone(), cache.clone(), metrics.clone()));

    // Background tasks
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let mut handles = checker.clone().run(&shutdown_tx);
    handles.push(tokio::spawn(certs.clone().run_rotation(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(
        transports.clone().run_rotation_watch(CERT_WATCH_PERIOD, shutdown_tx.subscribe()),
    ));
    if let Some(cache) = &cache {
        tasks::reconcile_cached_pods(cache, &api, gate.as_ref(), &config.node_name).await;
        let existence: Arc<dyn ObjectExistence> = Arc::new(RemoteObjectExistence::new(api.clone(), gate.clone()));
        handles.push(tasks::spawn_event_gc(
            cache.clone(),
            existence,
            config.gc_frequency(),
            shutdown_tx.subscribe(),
        ));
        handles.push(tasks::spawn_agent_watch(
            cache.clone(),
            api.clone(),
            gate.clone(),
            config.cache_agents.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    // Listeners
    let plain_addr = server::parse_addr(&config.proxy_address)?;
    let admin_addr = server::parse_addr(&config.admin_address)?;
    let tls = match &config.tls {
        Some(files) => Some(TlsAcceptor::from(
            TlsServerConfig::from_files(&files.cert_file, &files.key_file)?.config,
        )),
        None => {
            warn!("TLS serving certificate not configured - secure proxy listener not started");
            None
        }
    };

    let mut proxy_addrs = vec![(plain_addr, None)];
    if let Some(acceptor) = &tls {
        proxy_addrs.push((secure_addr, Some(acceptor.clone())));
    }
    if let Some(ip) = config.dummy_if_ip {
        proxy_addrs.push((server::rebind(plain_addr, ip), None));
        if let Some(acceptor) = &tls {
            proxy_addrs.push((server::rebind(secure_addr, ip), Some(acceptor.clone())));
        }
    }
    for (addr, acceptor) in proxy_addrs {
        let listener = server::bind(addr).await?;
        handles.push(tokio::spawn(server::serve_proxy(
            listener,
            acceptor,
            handler.clone(),
            shutdown_tx.subscribe(),
        )));
    }
    let admin_listener = server::bind(admin_addr).await?;
    handles.push(tokio::spawn(server::serve_admin(
        admin_listener,
        admin,
        shutdown_tx.subscribe(),
    )));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received, stopping {} tasks", handles.len());
    let _ = shutdown_tx.send(());
    for task in handles {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    info!("edge-hub stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
