use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use infermesh_cluster::ClusterNodes;
use infermesh_commons::utils::config::CoordinatorConfig;
use infermesh_commons::utils::logging::init_logging;
use infermesh_coordinator::exception::ExceptionMonitor;
use infermesh_coordinator::manager::ReqManager;
use infermesh_coordinator::metrics::MetricsListener;
use infermesh_coordinator::monitor::RequestMonitor;
use infermesh_coordinator::repeater::{
    Repeater,
    RepeaterRouteSink,
};
use infermesh_coordinator::router::Router;
use infermesh_coordinator::scheduler::{
    LeastTaskScheduler,
    Scheduler,
};
use infermesh_coordinator::server;
use infermesh_coordinator::sync::SyncContext;
use infermesh_transport::tls::load_tls_client_config;
use infermesh_transport::{
    ConnectionPool,
    PoolConfig,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coordinator.json".to_string());
    let cfg = Arc::new(
        CoordinatorConfig::load(&config_path)
            .with_context(|| format!("loading coordinator config from {config_path}"))?,
    );

    let tls = match cfg.tls.as_ref() {
        Some(tls_cfg) => Some(load_tls_client_config(tls_cfg).context("loading client tls")?),
        None => None,
    };
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig {
            max_conns: cfg.connection_pool_max_conn,
            connect_timeout: Duration::from_secs(cfg.http_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(cfg.conn_idle_timeout_secs),
        },
        tls,
    ));

    let cluster = Arc::new(ClusterNodes::new(cfg.deploy_mode));
    let scheduler: Arc<dyn Scheduler> =
        Arc::new(LeastTaskScheduler::new(cluster.clone(), cfg.deploy_mode));
    let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler.clone()));
    let exception = Arc::new(ExceptionMonitor::new());
    let repeater = Repeater::new(
        cfg.clone(),
        cluster.clone(),
        manager.clone(),
        scheduler.clone(),
        exception.clone(),
        pool,
    );
    scheduler.set_route_sink(Arc::new(RepeaterRouteSink(repeater.clone())));
    repeater.register_exception_handlers();
    exception.start();

    let request_monitor = Arc::new(RequestMonitor::new(
        manager.clone(),
        exception.clone(),
        cfg.clone(),
    ));
    request_monitor.start();

    let metrics = Arc::new(MetricsListener::new(
        cluster.clone(),
        manager.clone(),
        Duration::from_secs(cfg.metrics_reuse_secs),
    ));
    let sync = Arc::new(SyncContext::new(
        cfg.clone(),
        cluster.clone(),
        scheduler.clone(),
        repeater.clone(),
    ));
    let router = Arc::new(Router::new(
        cfg.clone(),
        cluster,
        manager,
        scheduler,
        repeater,
        exception.clone(),
        metrics,
        sync,
    ));

    let listener = TcpListener::bind((cfg.listen_ip.as_str(), cfg.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_ip, cfg.listen_port))?;

    let shutdown = Arc::new(Notify::new());
    let server_handle = tokio::spawn(server::serve(router, listener, shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.notify_waiters();
    request_monitor.stop().await;
    exception.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    info!("coordinator shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = async {
                match sigterm.as_mut() {
                    Some(sigterm) => { sigterm.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.ok();
    }
}
