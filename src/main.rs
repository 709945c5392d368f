use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use respgate::admin::{self, AdminState};
use respgate::backend::manager::ManagerOptions;
use respgate::backend::BackendManager;
use respgate::cluster::registry::{ClusterRegistry, InMemoryClusterRegistry};
use respgate::cluster::router::{new_balancer, BackendRouter, StaticRouter, SyncRouter};
use respgate::cluster::ClusterInstance;
use respgate::config::{ProxyConfig, RouterMode};
use respgate::proxy::ProxyServer;
use respgate::session::manager::SessionManager;

const BANNER: &str = r#"
                                     _
  _ __ ___  ___ _ __   __ _  __ _  _| |_ ___
 | '__/ _ \/ __| '_ \ / _` |/ _` ||_   _/ _ \
 | | |  __/\__ \ |_) | (_| | (_| |  | ||  __/
 |_|  \___||___/ .__/ \__, |\__,_|  |_| \___|
               |_|    |___/
"#;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(15);

fn main() -> Result<()> {
    let config = ProxyConfig::parse();
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut builder = if config.multi_core {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if config.core_num > 0 {
            builder.worker_threads(config.core_num);
        }
        builder
    } else {
        tokio::runtime::Builder::new_current_thread()
    };
    let runtime = builder
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ProxyConfig) -> Result<()> {
    println!("{BANNER}");
    info!(node = %config.node.id, namespace = %config.node.namespace, "starting respgate");

    let (registry, events) = InMemoryClusterRegistry::new();

    let mode = config.router.mode()?;
    let balancer = new_balancer(config.router.balancer_kind()?);
    let (router, static_addr): (Box<dyn BackendRouter>, Option<String>) = match mode {
        RouterMode::Static => {
            let (host, port) = config.router.static_endpoint()?;
            let instance = ClusterInstance::local(&host, port);
            // feed the static backend through the same event path the
            // control plane would use
            registry.add_cluster(instance.key.clone());
            registry
                .status_change(instance.clone())
                .context("failed to seed static backend")?;
            let addr = instance.addr();
            (Box::new(StaticRouter::new(instance)), addr)
        }
        RouterMode::Sync => {
            info!(
                cp_addr = %config.router.cp_addr.as_deref().unwrap_or_default(),
                "sync mode: cluster registry is fed via the admin surface"
            );
            let shared: Arc<dyn ClusterRegistry> = registry.clone();
            (Box::new(SyncRouter::new(shared)), None)
        }
    };

    let manager = BackendManager::new(
        ManagerOptions {
            pool_size: config.backend_pool.max_size,
            max_idle: config.backend_pool.max_idle,
            fixed_pool: config.backend_pool.fixed,
            static_addr,
        },
        router,
        balancer,
    );
    let event_loop = manager.spawn_event_loop(events);
    let session_mgr = SessionManager::new(manager);
    let proxy = ProxyServer::new(config.port, mode == RouterMode::Sync, session_mgr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin_state = AdminState {
        registry: registry.clone(),
        metrics_enabled: config.metrics.enable,
        metrics_sink: config.metrics.sink_kind()?,
    };
    let admin_task = tokio::spawn(admin::serve(
        config.service_port,
        admin_state,
        config.metrics.path.clone(),
        shutdown_rx.clone(),
    ));
    let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

    wait_for_signal().await;
    info!("signal received, shutting down");
    let _ = shutdown_tx.send(true);
    match timeout(SHUTDOWN_BUDGET, proxy_task).await {
        Ok(result) => {
            if let Err(err) = result.context("proxy task panicked")? {
                warn!(error = %err, "proxy exited with error");
            }
        }
        Err(_) => warn!("graceful shutdown timed out"),
    }
    admin_task.abort();
    event_loop.abort();
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
