//! vigil server: wires the stores, checkers, selector, and the three proxy
//! planes together, and owns process lifecycle.

mod router;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigil_core::checker::Scheduler;
use vigil_core::config::ConfigHandle;
use vigil_core::proxy::{GrpcProxy, HttpProxy};
use vigil_core::selector::Selector;
use vigil_core::storage::{ExternalEndpointStore, HeightStore};
use vigil_core::types::Protocol;

/// Drain budget for graceful shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the config watcher polls the file for changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,vigil_core=info,vigil_server=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("VIGIL_LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

fn init_prometheus() -> PrometheusHandle {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to install Prometheus recorder, using fallback");
            PrometheusBuilder::new().build_recorder().handle()
        }
    }
}

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VIGIL_CONFIG").ok())
        .unwrap_or_else(|| "config/vigil.toml".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("failed to install crypto provider: {e:?}"))?;

    init_logging();

    let path = config_path();
    let config = ConfigHandle::load(&path)
        .with_context(|| format!("failed to load configuration from {path}"))?;

    let prometheus = init_prometheus();

    let heights = Arc::new(HeightStore::new());
    let endpoints = Arc::new(ExternalEndpointStore::new());
    let selector = Arc::new(Selector::new(heights.clone(), endpoints.clone(), config.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let _watcher = config.spawn_watcher(CONFIG_POLL_INTERVAL, shutdown_tx.subscribe());

    let scheduler = Arc::new(
        Scheduler::new(heights.clone(), endpoints.clone(), config.clone())
            .context("failed to build scheduler")?,
    );
    let scheduler_handles = scheduler.start(&shutdown_tx);

    let mut servers: Vec<JoinHandle<()>> = Vec::new();
    let mut grpc_proxies: Vec<Arc<GrpcProxy>> = Vec::new();

    let cfg = config.snapshot();

    // Status surface (peers poll /{network}/status here).
    servers.push(
        spawn_http_server(
            &cfg.listen,
            router::status_router(router::StatusState {
                selector: selector.clone(),
                config: config.clone(),
                prometheus,
            }),
            "status",
            "-",
            shutdown_tx.subscribe(),
        )
        .await?,
    );

    // Per-network proxy listeners.
    for network in &cfg.networks {
        if cfg.api && !network.api_listen.is_empty() {
            let proxy = HttpProxy::new(
                network.name.clone(),
                Protocol::Api,
                selector.clone(),
                endpoints.clone(),
                config.clone(),
            )
            .context("failed to build api proxy client")?;
            servers.push(
                spawn_http_server(
                    &network.api_listen,
                    proxy.router(),
                    "api proxy",
                    &network.name,
                    shutdown_tx.subscribe(),
                )
                .await?,
            );
        }

        if cfg.rpc && !network.rpc_listen.is_empty() {
            let proxy = HttpProxy::new(
                network.name.clone(),
                Protocol::Rpc,
                selector.clone(),
                endpoints.clone(),
                config.clone(),
            )
            .context("failed to build rpc proxy client")?;
            servers.push(
                spawn_http_server(
                    &network.rpc_listen,
                    proxy.router(),
                    "rpc proxy",
                    &network.name,
                    shutdown_tx.subscribe(),
                )
                .await?,
            );
        }

        if cfg.grpc && !network.grpc_listen.is_empty() {
            let listener = TcpListener::bind(&network.grpc_listen)
                .await
                .with_context(|| format!("failed to bind grpc listener {}", network.grpc_listen))?;
            info!(network = %network.name, addr = %network.grpc_listen, "grpc proxy listening");

            let proxy = GrpcProxy::new(
                network.name.clone(),
                selector.clone(),
                endpoints.clone(),
                config.clone(),
            );
            grpc_proxies.push(proxy.clone());
            servers.push(tokio::spawn(proxy.serve(listener, shutdown_tx.subscribe())));
        }
    }

    info!(
        status_listen = %cfg.listen,
        networks = cfg.networks.len(),
        internal_nodes = cfg.internals.len(),
        external_rings = cfg.externals.len(),
        "vigil is fully operational"
    );

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(());

    // Give servers the drain budget, then stop waiting.
    let drain = async {
        for server in servers {
            let _ = server.await;
        }
        for handle in scheduler_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        error!("drain budget exceeded, forcing shutdown");
    }

    // Pooled connections close last.
    scheduler.close();
    for proxy in &grpc_proxies {
        proxy.close();
    }

    info!("shutdown complete");
    Ok(())
}

/// Binds and serves an axum router with graceful shutdown wired to the
/// broadcast channel.
async fn spawn_http_server(
    addr: &str,
    app: axum::Router,
    kind: &'static str,
    network: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {kind} listener {addr}"))?;
    info!(kind, network, addr, "listener started");

    let network = network.to_string();
    Ok(tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        });
        if let Err(e) = serve.await {
            error!(kind, network = %network, error = %e, "server failed");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
