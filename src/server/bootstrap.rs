use crate::config::GatewayConfig;
use crate::etcd::EtcdClient;
use crate::metrics::Metrics;
use crate::plugin::PluginRegistry;
use crate::server::{self, runtime::WorkerCount, GatewayState};
use crate::store::{ConfigStore, EtcdMap, InMemoryMap, ReplicatedMap};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
    pub workers: WorkerCount,
}

/// Gateway lifecycle: init → build → sync → publish → serve → shutdown.
///
/// `plugins` carries every action, filter and hook class the mapping files
/// may name; register custom classes before calling this.
pub async fn run(args: BootstrapArgs, plugins: PluginRegistry) -> Result<()> {
    init_tracing();
    tracing::info!(
        workers = args.workers.threads,
        source = args.workers.source,
        "server: runtime sized"
    );

    // Phase 1: config and state.
    let config = GatewayConfig::load(&args.config_path)?;
    let shutdown = Arc::new(Notify::new());
    let (mappings, errors, etcd_maps) = build_maps(&config).await?;
    let state = GatewayState::build(config, mappings, errors, plugins)?
        .with_metrics(Metrics::install()?);

    // Phase 2: follow the replicated store, then catch up with what is there.
    state.store.start_listener(shutdown.clone());
    match state.store.sync_from_store().await {
        Ok(true) => tracing::info!(
            generation = state.store.snapshot().generation,
            "store: joined with replicated mappings"
        ),
        Ok(false) => tracing::info!("store: replicated store is empty"),
        Err(e) => tracing::warn!(error = %e, "store: initial sync failed, waiting for publish"),
    }
    for map in &etcd_maps {
        map.start_watch(shutdown.clone());
    }

    // Phase 3: initial publish of the local directory. Failure is fatal.
    if state.config.mappings.publish_on_start {
        match state.store.reload_scheduled().await {
            Ok(Some(report)) => tracing::info!(
                generation = report.generation,
                versions = report.versions,
                endpoints = report.endpoints,
                elapsed_ms = report.elapsed_ms,
                "store: initial mappings published"
            ),
            Ok(None) => {}
            Err(e) => return Err(e.context("initial mapping load")),
        }
    }

    // Phase 4: background loops.
    state.limiter.start_reset_task(shutdown.clone());
    state.limiter.start_gc(shutdown.clone());
    if let Some(secs) = state.config.mappings.reload_interval_secs {
        start_periodic_reload(state.store.clone(), Duration::from_secs(secs), &shutdown);
    }

    // Phase 5: servers.
    start_admin_server(&state, &args);
    tracing::info!("server: starting gateway, listen={}", args.listen);
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 6: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

type Maps = (Arc<dyn ReplicatedMap>, Arc<dyn ReplicatedMap>, Vec<Arc<EtcdMap>>);

/// etcd-backed maps when endpoints are configured, otherwise an in-process
/// pair that only this node sees.
async fn build_maps(config: &GatewayConfig) -> Result<Maps> {
    if !config.store.is_distributed() {
        tracing::info!("store: no etcd endpoints configured, using in-process maps");
        let mappings: Arc<dyn ReplicatedMap> = Arc::new(InMemoryMap::new());
        let errors: Arc<dyn ReplicatedMap> = Arc::new(InMemoryMap::new());
        return Ok((mappings, errors, Vec::new()));
    }

    let etcd_cfg = &config.store.etcd;
    let client = EtcdClient::connect(etcd_cfg)
        .await
        .context("connecting to etcd")?;
    tracing::info!("etcd: connected to {}", client.base_url());

    let mappings = Arc::new(EtcdMap::new(client.clone(), &etcd_cfg.mappings_prefix));
    let errors = Arc::new(EtcdMap::new(client, &etcd_cfg.errors_prefix));
    let shared: (Arc<dyn ReplicatedMap>, Arc<dyn ReplicatedMap>) = (mappings.clone(), errors.clone());
    Ok((shared.0, shared.1, vec![mappings, errors]))
}

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_periodic_reload(store: Arc<ConfigStore>, interval: Duration, shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            match store.reload_scheduled().await {
                Ok(Some(report)) => tracing::debug!(
                    generation = report.generation,
                    "store: periodic reload completed"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    error = %format!("{:#}", e),
                    "store: periodic reload failed, keeping current snapshot"
                ),
            }
        }
    });
}

fn start_admin_server(state: &GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: SIGTERM handler unavailable, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
