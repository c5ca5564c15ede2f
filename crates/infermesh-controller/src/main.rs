use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use infermesh_commons::utils::config::{
    ControllerConfig,
    CONTROLLER_CONFIG_ENV,
};
use infermesh_commons::utils::logging::init_logging;
use infermesh_controller::coordinator_sync::{
    CoordinatorStore,
    CoordinatorSyncHandler,
};
use infermesh_controller::inventory::{
    InventoryReporter,
    INVENTORY_SEM_NAME,
    INVENTORY_SHM_NAME,
    INVENTORY_SHM_SIZE,
};
use infermesh_controller::node_manager::NodeManagerSender;
use infermesh_controller::node_status::NodeStatus;
use infermesh_controller::persist::FileFaultStore;
use infermesh_controller::recovery::NpuRecoveryManager;
use infermesh_controller::server::{
    self,
    ControllerServer,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{
    info,
    warn,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cfg = Arc::new(if std::env::var(CONTROLLER_CONFIG_ENV).is_ok() {
        ControllerConfig::load_from_env().context("loading controller config from env")?
    } else {
        let path = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "controller.json".to_string());
        ControllerConfig::load(&path)
            .with_context(|| format!("loading controller config from {path}"))?
    });

    let node_status = Arc::new(NodeStatus::new());
    let sender = NodeManagerSender::new(
        cfg.node_manager_port,
        Duration::from_secs(cfg.http_timeout_secs),
    );
    let store = Arc::new(FileFaultStore::new(
        &cfg.recovery.processed_faults_path,
        cfg.recovery.check_mounted_files,
    ));
    let recovery = NpuRecoveryManager::new(
        cfg.recovery.clone(),
        node_status.clone(),
        sender,
        store,
    );

    let coordinator_store = Arc::new(CoordinatorStore::new());
    for ip in &cfg.coordinator_ips {
        coordinator_store.add(ip);
    }
    let sync = Arc::new(CoordinatorSyncHandler::new(
        cfg.clone(),
        node_status.clone(),
        coordinator_store,
    ));
    let sync_task = tokio::spawn(sync.clone().run_loop());

    // The inventory ring feeds the CCAE reporter with pulled metrics.
    let inventory =
        match InventoryReporter::new(INVENTORY_SHM_NAME, INVENTORY_SEM_NAME, INVENTORY_SHM_SIZE) {
            Ok(inventory) => Some(Arc::new(inventory)),
            Err(e) => {
                warn!(error = %e, "inventory reporter unavailable");
                None
            }
        };
    let inventory_task = inventory.map(|inventory| {
        let sync = sync.clone();
        let interval = Duration::from_secs(cfg.sync_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                if let Some(metrics) = sync.pull_metrics().await {
                    let payload = serde_json::json!({ "metrics": metrics }).to_string();
                    if let Err(e) = inventory.write(payload.as_bytes()) {
                        warn!(error = %e, "inventory write failed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    });

    let listener = TcpListener::bind((cfg.listen_ip.as_str(), cfg.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_ip, cfg.listen_port))?;
    let shutdown = Arc::new(Notify::new());
    let controller_server = Arc::new(ControllerServer::new(node_status, recovery.clone()));
    let server_task = tokio::spawn(server::serve(controller_server, listener, shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.notify_waiters();
    sync_task.abort();
    if let Some(task) = inventory_task {
        task.abort();
    }
    recovery.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;
    info!("controller shutdown complete");
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
