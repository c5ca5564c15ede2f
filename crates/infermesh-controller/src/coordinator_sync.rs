//! Controller → Coordinator synchronization: publishes the filtered cluster
//! view on a fixed cadence and pulls aggregated metrics back for the
//! inventory reporter.

use std::sync::atomic::{
    AtomicBool,
    AtomicU64,
    Ordering,
};
use std::sync::Arc;
use std::time::Duration;

use infermesh_commons::models::cluster_wire::{
    ClusterViewBody,
    InstanceRole,
    NodeEntry,
};
use infermesh_commons::utils::concurrent::Registry;
use infermesh_commons::utils::config::{
    ControllerConfig,
    MODEL_ID_ENV,
};
use tracing::{
    debug,
    error,
    info,
};

use crate::node_status::{
    InferenceType,
    NodeInfo,
    NodeStatus,
};

const SEND_STATUS_INFO_LOG_FREQUENCY: u64 = 60;

#[derive(Debug, Clone)]
pub struct Coordinator {
    pub ip: String,
    pub is_healthy: bool,
}

pub struct CoordinatorStore {
    coordinators: Registry<String, Coordinator>,
}

impl CoordinatorStore {
    pub fn new() -> Self {
        Self {
            coordinators: Registry::new(),
        }
    }

    pub fn add(&self, ip: &str) {
        self.coordinators.set(
            ip.to_string(),
            Coordinator {
                ip: ip.to_string(),
                is_healthy: true,
            },
        );
    }

    pub fn all(&self) -> Vec<Coordinator> {
        self.coordinators
            .keys()
            .into_iter()
            .filter_map(|ip| self.coordinators.get(&ip))
            .collect()
    }

    pub fn update_status(&self, ip: &str, is_healthy: bool) {
        self.coordinators.update(&ip.to_string(), |coordinator| {
            coordinator.is_healthy = is_healthy;
        });
    }

    pub fn is_healthy(&self, ip: &str) -> bool {
        self.coordinators
            .get(&ip.to_string())
            .map(|coordinator| coordinator.is_healthy)
            .unwrap_or(false)
    }
}

pub struct CoordinatorSyncHandler {
    cfg: Arc<ControllerConfig>,
    node_status: Arc<NodeStatus>,
    store: Arc<CoordinatorStore>,
    http: reqwest::Client,
    model_id_override: Option<String>,
    run: AtomicBool,
    round_counter: AtomicU64,
    last_pd_counter: AtomicU64,
}

impl CoordinatorSyncHandler {
    pub fn new(
        cfg: Arc<ControllerConfig>, node_status: Arc<NodeStatus>, store: Arc<CoordinatorStore>,
    ) -> Self {
        Self {
            cfg,
            node_status,
            store,
            http: reqwest::Client::new(),
            model_id_override: std::env::var(MODEL_ID_ENV).ok(),
            run: AtomicBool::new(true),
            round_counter: AtomicU64::new(0),
            last_pd_counter: AtomicU64::new(0),
        }
    }

    pub fn set_run_status(&self, run: bool) {
        self.run.store(run, Ordering::Release);
    }

    fn should_log_this_round(&self) -> bool {
        self.round_counter.fetch_add(1, Ordering::Relaxed) % SEND_STATUS_INFO_LOG_FREQUENCY == 0
    }

    /// Builds the publishable view: drop UNAVAILABLE nodes and, in PD mode,
    /// PD instances without available peers.
    pub fn generate_node_view(&self, print_info_log: bool) -> ClusterViewBody {
        let mut view = ClusterViewBody::default();
        let mut p_count = 0u64;
        let mut d_count = 0u64;
        for node in self.node_status.all_nodes() {
            if node.inference_type == InferenceType::Unavailable {
                debug!(id = node.id, ip = %node.ip, "skipping unavailable node");
                continue;
            }
            let mut entry = to_entry(&node);
            if let Some(model_id) = self.model_id_override.as_ref() {
                entry.model_name = model_id.clone();
            }
            if self.cfg.deploy_mode.is_pd()
                && matches!(node.role, InstanceRole::Prefill | InstanceRole::Decode)
            {
                if entry.dynamic_info.peers.is_empty() {
                    debug!(id = node.id, ip = %node.ip,
                        "skipping pd node with no available peers");
                    continue;
                }
                match node.role {
                    InstanceRole::Prefill => p_count += 1,
                    InstanceRole::Decode => d_count += 1,
                    _ => {}
                }
            }
            view.ids.push(entry.id);
            view.instances.push(entry);
        }
        let pd_counter = (d_count << 32) | p_count;
        let last = self.last_pd_counter.swap(pd_counter, Ordering::Relaxed);
        if last != pd_counter || print_info_log {
            info!(
                nodes = view.instances.len(),
                prefill = p_count,
                decode = d_count,
                "generated node status view"
            );
        }
        view
    }

    /// POSTs the view to every coordinator; health flips on HTTP outcome.
    pub async fn send_node_status(&self) {
        if !self.run.load(Ordering::Acquire) {
            info!("synchronization is off, skipping node status push");
            return;
        }
        let print_info_log = self.should_log_this_round();
        let view = self.generate_node_view(print_info_log);
        for coordinator in self.store.all() {
            let url = format!(
                "http://{}:{}/v1/refresh",
                coordinator.ip, self.cfg.coordinator_port
            );
            let result = self
                .http
                .post(&url)
                .timeout(Duration::from_secs(self.cfg.http_timeout_secs))
                .json(&view)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    self.store.update_status(&coordinator.ip, true);
                }
                Ok(response) => {
                    error!(%url, status = %response.status(), "node status push rejected");
                    self.store.update_status(&coordinator.ip, false);
                    return;
                }
                Err(e) => {
                    error!(%url, error = %e, "node status push failed");
                    self.store.update_status(&coordinator.ip, false);
                    return;
                }
            }
        }
    }

    /// Pulls the aggregated Prometheus text back from the coordinators.
    pub async fn pull_metrics(&self) -> Option<String> {
        let mut last_response = None;
        for coordinator in self.store.all() {
            let url = format!(
                "http://{}:{}/metrics",
                coordinator.ip, self.cfg.coordinator_external_port
            );
            let result = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(self.cfg.http_timeout_secs))
                .send()
                .await;
            let response = match result {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    error!(%url, status = %response.status(), "metrics pull rejected");
                    self.store.update_status(&coordinator.ip, false);
                    return last_response;
                }
                Err(e) => {
                    error!(%url, error = %e, "metrics pull failed");
                    self.store.update_status(&coordinator.ip, false);
                    return last_response;
                }
            };
            let text = response.text().await.unwrap_or_default();
            if text.is_empty() {
                error!(%url, "metrics response is empty");
                return last_response;
            }
            if !validate_prometheus(&text) {
                error!(%url, "metrics response failed validation");
                return last_response;
            }
            self.store.update_status(&coordinator.ip, true);
            last_response = Some(text);
        }
        last_response
    }

    /// Cadenced loop; runs until the task is aborted.
    pub async fn run_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.sync_interval_secs.max(1));
        loop {
            self.send_node_status().await;
            tokio::time::sleep(interval).await;
        }
    }
}

fn to_entry(node: &NodeInfo) -> NodeEntry {
    let mut dynamic_info = node.dynamic_info.clone();
    dynamic_info.peers = node
        .active_peers
        .iter()
        .filter(|peer| node.peers.contains(peer))
        .copied()
        .collect();
    NodeEntry {
        id: node.id,
        ip: node.ip.clone(),
        port: node.port.clone(),
        model_name: node.model_name.clone(),
        metric_port: node.metric_port.clone(),
        inter_comm_port: node.inter_comm_port.clone(),
        static_info: node.static_info.clone(),
        dynamic_info,
    }
}

/// Line-wise validation of pulled Prometheus text: only counter, gauge and
/// histogram types; counter/gauge samples and histogram sums, counts and
/// buckets must be non-negative.
pub fn validate_prometheus(text: &str) -> bool {
    let mut current_name = String::new();
    let mut current_type = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# HELP ") {
            current_name = rest.split_whitespace().next().unwrap_or("").to_string();
            current_type.clear();
            continue;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            let mut parts = rest.split_whitespace();
            let name = parts.next().unwrap_or("");
            let mtype = parts.next().unwrap_or("");
            if name != current_name {
                error!(name, current_name, "TYPE line does not match HELP line");
                return false;
            }
            if !matches!(mtype, "counter" | "gauge" | "histogram") {
                error!(name, mtype, "invalid metric type");
                return false;
            }
            current_type = mtype.to_string();
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if current_name.is_empty() || current_type.is_empty() {
            error!(line, "metric data before HELP and TYPE lines");
            return false;
        }
        let Some(last_space) = line.rfind(' ') else {
            error!(line, "invalid metric sample");
            return false;
        };
        let key = &line[..last_space];
        let Ok(value) = line[last_space + 1..].parse::<f64>() else {
            // NaN and infinity renderings are allowed through.
            let raw = &line[last_space + 1..];
            if matches!(raw, "Nan" | "+Inf" | "-Inf") {
                continue;
            }
            error!(line, "invalid metric value");
            return false;
        };
        match current_type.as_str() {
            "counter" | "gauge" => {
                if value < 0.0 {
                    error!(key, value, "negative counter or gauge value");
                    return false;
                }
            }
            "histogram" => {
                let is_component = key.starts_with(&format!("{current_name}_sum"))
                    || key.starts_with(&format!("{current_name}_count"))
                    || key.contains(&format!("{current_name}_bucket"));
                if is_component && value < 0.0 {
                    error!(key, value, "negative histogram component");
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}
