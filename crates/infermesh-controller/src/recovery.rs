//! NPU fault recovery. Consumes fault envelopes from ClusterD and drives the
//! engine state-control verbs against the node-managers of every pod in an
//! affected instance.
//!
//! Recovery only begins once the controller has seen at least one READY
//! prefill and one READY decode node; allowlisted switch faults observed
//! before that are remembered so they never trigger recovery later.

use std::collections::{
    HashMap,
    HashSet,
};
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::{
    Duration,
    Instant,
};

use futures::future::join_all;
use infermesh_commons::models::cluster_wire::InstanceRole;
use infermesh_commons::models::fault_wire::{
    FaultMsgSignal,
    NodeFaultInfo,
};
use infermesh_commons::utils::concurrent::{
    ConcurrentSet,
    Registry,
};
use infermesh_commons::utils::config::RecoveryConfig;
use tokio::task::{
    AbortHandle,
    JoinHandle,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

use crate::node_manager::{
    NodeManagerCmd,
    NodeManagerSender,
    NpuStatus,
};
use crate::node_status::{
    InferenceType,
    NodeStatus,
    ROLE_READY,
};
use crate::persist::FaultStore;

/// Switch fault codes eligible for recovery.
const FAULT_CODE_ALLOWLIST: &[&str] = &["[0x08520003,na,L2,na]"];
/// Fault codes a node heals on its own; anything else on an UnHealthy node
/// blacklists its instance.
const RECOVERING_CODE_ALLOWLIST: &[&str] = &["80CB8009"];

#[derive(Debug, Clone)]
pub struct FaultNode {
    pub node_ip: String,
    pub node_sn: String,
    pub fault_level: String,
}

#[derive(Debug, Clone)]
struct InstanceRecoveryInfo {
    fault_nodes: Vec<FaultNode>,
    pod_ips: HashSet<String>,
    start: Instant,
}

pub struct NpuRecoveryManager {
    cfg: RecoveryConfig,
    node_status: Arc<NodeStatus>,
    sender: NodeManagerSender,
    store: Arc<dyn FaultStore>,
    instance_recovery: Registry<u64, InstanceRecoveryInfo>,
    isolation_timers: Registry<u64, AbortHandle>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    processed: ConcurrentSet<String>,
    not_ready_faults: ConcurrentSet<String>,
    ready_checked: AtomicBool,
}

impl NpuRecoveryManager {
    pub fn new(
        cfg: RecoveryConfig, node_status: Arc<NodeStatus>, sender: NodeManagerSender,
        store: Arc<dyn FaultStore>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            cfg,
            node_status,
            sender,
            store,
            instance_recovery: Registry::new(),
            isolation_timers: Registry::new(),
            poll_task: StdMutex::new(None),
            processed: ConcurrentSet::new(),
            not_ready_faults: ConcurrentSet::new(),
            ready_checked: AtomicBool::new(false),
        });
        match manager.store.load() {
            Ok(faults) => {
                for fault in faults {
                    manager.processed.insert(fault);
                }
            }
            Err(e) => warn!(error = %e, "loading processed switch faults failed"),
        }
        manager
    }

    pub fn processed_faults(&self) -> Vec<String> {
        self.processed.to_vec()
    }

    pub fn instances_in_recovery(&self) -> Vec<u64> {
        self.instance_recovery.keys()
    }

    pub fn is_recovery_in_progress(&self) -> bool {
        !self.instance_recovery.is_empty()
    }

    /// Entry point for one fault envelope.
    pub async fn process_fault_message(self: &Arc<Self>, msg: &FaultMsgSignal) {
        if !self.cfg.enabled {
            info!("npu recovery disabled, skipping fault message");
            return;
        }
        if !self.first_coordinator_ready() {
            // Record allowlisted faults seen before readiness; they must
            // never trigger recovery later.
            for node in &msg.node_fault_info {
                for device in &node.fault_device {
                    for fault in &device.switch_fault_infos {
                        if !fault.fault_code.is_empty()
                            && self.fault_code_allowlisted(&fault.fault_code)
                        {
                            self.not_ready_faults.insert(fault.unique_id());
                        }
                    }
                }
            }
            return;
        }

        info!(nodes = msg.node_fault_info.len(), "processing fault message");
        let (faulty_instances, blacklisted) = self.find_faulty_instances(msg);
        if faulty_instances.is_empty() && blacklisted.is_empty() {
            info!("no instances require fault recovery");
            return;
        }
        if !blacklisted.is_empty() {
            info!(count = blacklisted.len(), "hard-restarting blacklisted instances");
            self.restart_instances(&blacklisted).await;
        }
        if !faulty_instances.is_empty() {
            self.process_instance_faults(faulty_instances).await;
        }
    }

    fn fault_code_allowlisted(&self, fault_code: &str) -> bool {
        FAULT_CODE_ALLOWLIST
            .iter()
            .any(|allowed| fault_code.contains(allowed))
    }

    /// True when the node carries a fault code that is not self-healing.
    fn has_critical_fault(&self, node: &NodeFaultInfo) -> bool {
        if !self.is_recovery_in_progress() {
            return true;
        }
        if node.fault_device.is_empty() {
            warn!(node = %node.node_ip, "fault device list empty, treating as critical");
            return true;
        }
        for device in &node.fault_device {
            if device.fault_level != "UnHealthy" {
                continue;
            }
            if device.fault_codes.len() != device.fault_levels.len()
                || device.fault_codes.is_empty()
            {
                warn!(node = %node.node_ip, "malformed fault code report, treating as critical");
                return true;
            }
            for (code, level) in device.fault_codes.iter().zip(device.fault_levels.iter()) {
                if level == "NotHandleFault" {
                    continue;
                }
                if !RECOVERING_CODE_ALLOWLIST.contains(&code.as_str()) {
                    return true;
                }
            }
        }
        false
    }

    /// Groups faulty nodes by instance, blacklisting instances with a
    /// critical unhealthy node. A blacklisted instance cannot also be a
    /// recovery target in the same pass.
    fn find_faulty_instances(
        self: &Arc<Self>, msg: &FaultMsgSignal,
    ) -> (HashMap<u64, Vec<FaultNode>>, HashSet<u64>) {
        let mut faulty: HashMap<u64, Vec<FaultNode>> = HashMap::new();
        let mut blacklisted: HashSet<u64> = HashSet::new();
        let mut new_processed: Vec<String> = Vec::new();

        for node in &msg.node_fault_info {
            let Some(instance_id) = self.instance_id_by_node_ip(&node.node_ip) else {
                info!(node = %node.node_ip, "cannot find instance for faulty node");
                continue;
            };
            if node.fault_level == "UnHealthy" && self.has_critical_fault(node) {
                debug!(node = %node.node_ip, instance_id, "blacklisting instance");
                blacklisted.insert(instance_id);
                faulty.remove(&instance_id);
                continue;
            }
            if blacklisted.contains(&instance_id) {
                continue;
            }
            let (has_valid, fault_ids) = self.extract_valid_switch_faults(node);
            if has_valid {
                faulty.entry(instance_id).or_default().push(FaultNode {
                    node_ip: node.node_ip.clone(),
                    node_sn: node.node_sn.clone(),
                    fault_level: node.fault_level.clone(),
                });
                new_processed.extend(fault_ids);
                info!(node = %node.node_ip, instance_id, "fault node queued for npu recovery");
            }
        }

        if !faulty.is_empty() && !new_processed.is_empty() {
            self.update_processed_faults(&new_processed);
        }
        info!(
            recovering = faulty.len(),
            blacklisted = blacklisted.len(),
            "fault partition complete"
        );
        (faulty, blacklisted)
    }

    /// Switch faults that are allowlisted, unseen, and not from the
    /// pre-readiness window.
    fn extract_valid_switch_faults(&self, node: &NodeFaultInfo) -> (bool, Vec<String>) {
        let mut valid = Vec::new();
        for device in &node.fault_device {
            for fault in &device.switch_fault_infos {
                if fault.fault_code.is_empty() || !self.fault_code_allowlisted(&fault.fault_code) {
                    continue;
                }
                let unique_id = fault.unique_id();
                if self.not_ready_faults.contains(&unique_id) {
                    debug!(%unique_id, "skipping fault recorded before readiness");
                    continue;
                }
                if self.processed.contains(&unique_id) {
                    continue;
                }
                valid.push(unique_id);
            }
        }
        (!valid.is_empty(), valid)
    }

    fn update_processed_faults(&self, new_faults: &[String]) {
        let mut fresh = Vec::new();
        for fault in new_faults {
            if self.processed.insert(fault.clone()) {
                fresh.push(fault.clone());
            }
        }
        if fresh.is_empty() {
            return;
        }
        if let Err(e) = self.store.append(&fresh) {
            error!(error = %e, "persisting processed switch faults failed");
        }
    }

    fn first_coordinator_ready(&self) -> bool {
        if self.ready_checked.load(Ordering::Acquire) {
            return true;
        }
        let mut p_ready = false;
        let mut d_ready = false;
        for node in self.node_status.all_nodes() {
            if node.role == InstanceRole::Prefill && node.role_state == ROLE_READY {
                p_ready = true;
            }
            if node.role == InstanceRole::Decode && node.role_state == ROLE_READY {
                d_ready = true;
            }
            if p_ready && d_ready {
                self.ready_checked.store(true, Ordering::Release);
                info!("coordinator ready, fault processing armed");
                return true;
            }
        }
        false
    }

    fn instance_id_by_node_ip(&self, node_ip: &str) -> Option<u64> {
        let node_id = self.node_status.find_node_by_host(node_ip)?;
        let node = self.node_status.get_node(node_id)?;
        Some(self.node_status.instance_id_of(&node))
    }

    // --- strategies ---

    async fn process_instance_faults(self: &Arc<Self>, faulty: HashMap<u64, Vec<FaultNode>>) {
        for (instance_id, fault_nodes) in faulty {
            if self.instance_recovery.contains(&instance_id) {
                debug!(instance_id, "instance already in recovery, skipping");
                continue;
            }
            let node_ids = self.node_status.nodes_in_instance(instance_id);
            let pod_ips = self.node_status.pod_ips_in_instance(instance_id);
            if node_ids.is_empty() || pod_ips.is_empty() {
                debug!(instance_id, "no nodes found for instance");
                continue;
            }
            if self.is_single_prefill_instance(&fault_nodes) {
                info!(instance_id, "prefill instance, using isolation strategy");
                self.process_prefill_isolation(instance_id, fault_nodes);
            } else {
                info!(instance_id, "using full npu recovery strategy");
                self.process_full_recovery(instance_id, fault_nodes, node_ids, pod_ips)
                    .await;
            }
        }
    }

    fn is_single_prefill_instance(&self, fault_nodes: &[FaultNode]) -> bool {
        for fault_node in fault_nodes {
            let Some(node_id) = self.node_status.find_node_by_host(&fault_node.node_ip) else {
                warn!(node = %fault_node.node_ip, "cannot find node id for faulty node");
                continue;
            };
            if let Some(node) = self.node_status.get_node(node_id) {
                if node.role == InstanceRole::Prefill && node.is_single_node {
                    return true;
                }
            }
        }
        false
    }

    /// Isolation strategy: only the faulty nodes go unavailable, and a
    /// one-shot timer restores them.
    fn process_prefill_isolation(self: &Arc<Self>, instance_id: u64, fault_nodes: Vec<FaultNode>) {
        for fault_node in &fault_nodes {
            if let Some(node_id) = self.node_status.find_node_by_host(&fault_node.node_ip) {
                self.node_status
                    .update_inference_type(node_id, InferenceType::Unavailable);
                info!(node_id, node = %fault_node.node_ip, "prefill fault node isolated");
            }
        }
        let manager = self.clone();
        let isolation = Duration::from_secs(self.cfg.prefill_isolation_secs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(isolation).await;
            manager.on_prefill_isolation_expired(instance_id, &fault_nodes);
        });
        self.isolation_timers.set(instance_id, handle.abort_handle());
        info!(
            instance_id,
            seconds = self.cfg.prefill_isolation_secs,
            "isolation timer started"
        );
    }

    fn on_prefill_isolation_expired(&self, instance_id: u64, fault_nodes: &[FaultNode]) {
        info!(instance_id, "isolation expired, restoring prefill nodes");
        for fault_node in fault_nodes {
            if let Some(node_id) = self.node_status.find_node_by_host(&fault_node.node_ip) {
                self.node_status
                    .update_inference_type(node_id, InferenceType::Available);
                info!(node_id, node = %fault_node.node_ip, "prefill node restored");
            }
        }
        self.isolation_timers.remove(&instance_id);
    }

    /// Full recovery: isolate the whole instance, PAUSE then REINIT every
    /// pod, and hand the instance to the 1 Hz poll loop. Any command failure
    /// aborts with a STOP_ENGINE sweep.
    async fn process_full_recovery(
        self: &Arc<Self>, instance_id: u64, fault_nodes: Vec<FaultNode>, node_ids: Vec<u64>,
        pod_ips: HashSet<String>,
    ) {
        for node_id in &node_ids {
            self.node_status
                .update_inference_type(*node_id, InferenceType::Unavailable);
        }
        self.instance_recovery.set(
            instance_id,
            InstanceRecoveryInfo {
                fault_nodes,
                pod_ips: pod_ips.clone(),
                start: Instant::now(),
            },
        );

        if !self
            .send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::PauseEngine)
            .await
        {
            warn!(instance_id, "PAUSE_ENGINE failed, aborting recovery");
            self.send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StopEngine)
                .await;
            self.instance_recovery.remove(&instance_id);
            return;
        }
        if !self
            .send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::ReinitNpu)
            .await
        {
            warn!(instance_id, "REINIT_NPU failed, aborting recovery");
            self.send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StopEngine)
                .await;
            self.instance_recovery.remove(&instance_id);
            return;
        }
        // The recovery window starts once REINIT_NPU is acknowledged.
        if !self.instance_recovery.update(&instance_id, |info| {
            info.start = Instant::now();
        }) {
            info!(instance_id, "instance removed during command execution");
            return;
        }
        self.start_polling();
        info!(
            instance_id,
            nodes = node_ids.len(),
            pods = pod_ips.len(),
            "npu recovery initiated"
        );
    }

    /// Blacklisted instances get a hard stop and stay unavailable; the sync
    /// path keeps them out of the published view.
    pub async fn restart_instances(self: &Arc<Self>, instance_ids: &HashSet<u64>) {
        for &instance_id in instance_ids {
            let node_ids = self.node_status.nodes_in_instance(instance_id);
            if node_ids.is_empty() {
                debug!(instance_id, "no nodes found for instance");
                continue;
            }
            for node_id in node_ids {
                self.node_status
                    .update_inference_type(node_id, InferenceType::Unavailable);
            }
            let pod_ips = self.node_status.pod_ips_in_instance(instance_id);
            if pod_ips.is_empty() {
                continue;
            }
            if !self
                .send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StopEngine)
                .await
            {
                info!(instance_id, "STOP_ENGINE failed, instance may not be running");
            }
        }
    }

    /// Hardware fault on an instance that is mid-recovery: cancel timers,
    /// drop it from the queue and hard-stop it.
    pub async fn abort_instance_recovery(self: &Arc<Self>, instance_id: u64) {
        if let Some(timer) = self.isolation_timers.remove(&instance_id) {
            timer.abort();
        }
        if self.instance_recovery.remove(&instance_id).is_none() {
            info!(instance_id, "no active recovery for instance");
            return;
        }
        info!(instance_id, "aborting npu recovery for instance");
        if self.instance_recovery.is_empty() {
            self.stop_polling();
        }
        let mut ids = HashSet::new();
        ids.insert(instance_id);
        self.restart_instances(&ids).await;
    }

    async fn send_command_parallel(
        &self, pod_ips: &HashSet<String>, instance_id: u64, cmd: NodeManagerCmd,
    ) -> bool {
        if pod_ips.is_empty() {
            debug!(instance_id, "no pods to command");
            return true;
        }
        info!(
            instance_id,
            pods = pod_ips.len(),
            cmd = cmd.as_str(),
            "sending command to all pods in parallel"
        );
        let results = join_all(pod_ips.iter().map(|pod_ip| {
            let sender = self.sender.clone();
            let pod_ip = pod_ip.clone();
            async move { sender.send_command(&pod_ip, cmd).await }
        }))
        .await;
        let mut success = true;
        for (pod_ip, result) in pod_ips.iter().zip(results) {
            if let Err(e) = result {
                error!(instance_id, pod = %pod_ip, cmd = cmd.as_str(), error = %e,
                    "node manager command failed");
                success = false;
            }
        }
        success
    }

    // --- poll loop ---

    fn start_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        let manager = self.clone();
        let interval = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !manager.poll_once().await {
                    break;
                }
            }
            info!("npu status polling stopped");
        }));
        info!("npu status polling started");
    }

    fn stop_polling(&self) {
        let task = self.poll_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// One poll tick; returns false once no instance is left in recovery.
    pub async fn poll_once(self: &Arc<Self>) -> bool {
        let instance_ids = self.instance_recovery.keys();
        if instance_ids.is_empty() {
            return false;
        }
        let timeout = Duration::from_secs(self.cfg.poll_timeout_secs);
        let mut recovered = Vec::new();
        let mut timed_out = Vec::new();
        for instance_id in instance_ids {
            let Some(info) = self.instance_recovery.get(&instance_id) else {
                continue;
            };
            if info.start.elapsed() >= timeout {
                info!(instance_id, "instance recovery timeout");
                timed_out.push((instance_id, info.pod_ips));
            } else if self.all_pods_ready(instance_id, &info.pod_ips).await {
                info!(instance_id, "instance recovery completed");
                recovered.push((instance_id, info.pod_ips));
            }
        }

        for (instance_id, pod_ips) in timed_out {
            self.instance_recovery.remove(&instance_id);
            self.send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StopEngine)
                .await;
        }
        for (instance_id, pod_ips) in recovered {
            self.instance_recovery.remove(&instance_id);
            if !self
                .send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StartEngine)
                .await
            {
                info!(instance_id, "START_ENGINE failed, stopping service");
                self.send_command_parallel(&pod_ips, instance_id, NodeManagerCmd::StopEngine)
                    .await;
                continue;
            }
            for node_id in self.node_status.nodes_in_instance(instance_id) {
                self.node_status
                    .update_inference_type(node_id, InferenceType::Available);
            }
            info!(instance_id, "instance service recovered");
        }

        !self.instance_recovery.is_empty()
    }

    async fn all_pods_ready(&self, instance_id: u64, pod_ips: &HashSet<String>) -> bool {
        for pod_ip in pod_ips {
            match self.sender.node_status(pod_ip).await {
                Ok(NpuStatus::Ready) => {}
                Ok(status) => {
                    info!(instance_id, pod = %pod_ip, ?status, "pod npu not ready yet");
                    return false;
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Test and shutdown hook: cancels timers and the poll loop.
    pub fn shutdown(&self) {
        self.stop_polling();
        for instance_id in self.isolation_timers.keys() {
            if let Some(timer) = self.isolation_timers.remove(&instance_id) {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use infermesh_commons::models::fault_wire::{
        DeviceFault,
        SwitchFaultInfo,
    };
    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::node_status::NodeInfo;
    use crate::persist::FileFaultStore;

    struct NodeManagerStub {
        port: u16,
        commands: Arc<Mutex<Vec<String>>>,
        status: Arc<Mutex<String>>,
    }

    async fn start_node_manager_stub() -> NodeManagerStub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(Mutex::new("ready".to_string()));
        let stub_commands = commands.clone();
        let stub_status = status.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let commands = stub_commands.clone();
                let status = stub_status.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let reply = if request.starts_with("POST /fault-command") {
                        if let Some(body) = request.split("\r\n\r\n").nth(1) {
                            if let Ok(json) =
                                serde_json::from_str::<serde_json::Value>(body)
                            {
                                if let Some(cmd) =
                                    json.get("cmd").and_then(serde_json::Value::as_str)
                                {
                                    commands.lock().unwrap().push(cmd.to_string());
                                }
                            }
                        }
                        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                            .to_string()
                    } else {
                        let body =
                            format!("{{\"status\":\"{}\"}}", status.lock().unwrap());
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    };
                    socket.write_all(reply.as_bytes()).await.ok();
                    socket.flush().await.ok();
                });
            }
        });
        NodeManagerStub {
            port,
            commands,
            status,
        }
    }

    fn ready_node(id: u64, host: &str, role: InstanceRole, pod_ip: &str) -> NodeInfo {
        NodeInfo {
            id,
            ip: pod_ip.to_string(),
            host_id: host.to_string(),
            role,
            role_state: ROLE_READY.to_string(),
            ..NodeInfo::default()
        }
    }

    fn switch_fault_msg(node_ip: &str, fault_time: &str) -> FaultMsgSignal {
        FaultMsgSignal {
            node_fault_info: vec![NodeFaultInfo {
                node_ip: node_ip.to_string(),
                node_sn: "sn-1".to_string(),
                fault_level: "Healthy".to_string(),
                fault_device: vec![DeviceFault {
                    switch_fault_infos: vec![SwitchFaultInfo {
                        fault_code: "[0x08520003,na,L2,na]".to_string(),
                        switch_chip_id: "0".to_string(),
                        switch_port_id: "1".to_string(),
                        fault_time: fault_time.to_string(),
                    }],
                    ..DeviceFault::default()
                }],
            }],
        }
    }

    fn build_manager(
        stub_port: u16, faults_path: &std::path::Path, poll_timeout_secs: u64,
    ) -> (Arc<NpuRecoveryManager>, Arc<NodeStatus>) {
        let node_status = Arc::new(NodeStatus::new());
        let cfg = RecoveryConfig {
            enabled: true,
            poll_interval_secs: 3600,
            poll_timeout_secs,
            prefill_isolation_secs: 1,
            processed_faults_path: faults_path.display().to_string(),
            check_mounted_files: false,
        };
        let sender = NodeManagerSender::new(stub_port, Duration::from_secs(2));
        let store = Arc::new(FileFaultStore::new(faults_path, false));
        let manager = NpuRecoveryManager::new(cfg, node_status.clone(), sender, store);
        (manager, node_status)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_recovery_happy_path() {
        let stub = start_node_manager_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let (manager, node_status) =
            build_manager(stub.port, &dir.path().join("faults.json"), 60);

        node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
        node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));

        manager
            .process_fault_message(&switch_fault_msg("host-d", "t0"))
            .await;

        assert_eq!(manager.instances_in_recovery(), vec![2]);
        assert_eq!(
            node_status.get_node(2).unwrap().inference_type,
            InferenceType::Unavailable
        );
        {
            let commands = stub.commands.lock().unwrap();
            assert_eq!(*commands, vec!["PAUSE_ENGINE", "REINIT_NPU"]);
        }

        // All pods report ready on the next poll.
        assert!(!manager.poll_once().await);
        assert!(manager.instances_in_recovery().is_empty());
        assert_eq!(
            node_status.get_node(2).unwrap().inference_type,
            InferenceType::Available
        );
        let commands = stub.commands.lock().unwrap();
        assert_eq!(commands.last().unwrap(), "START_ENGINE");
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recovery_timeout_stops_engine() {
        let stub = start_node_manager_stub().await;
        *stub.status.lock().unwrap() = "init".to_string();
        let dir = tempfile::tempdir().unwrap();
        let (manager, node_status) =
            build_manager(stub.port, &dir.path().join("faults.json"), 0);

        node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
        node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));

        manager
            .process_fault_message(&switch_fault_msg("host-d", "t1"))
            .await;
        assert_eq!(manager.instances_in_recovery(), vec![2]);

        // Zero poll timeout: the first tick expires the recovery window.
        assert!(!manager.poll_once().await);
        assert!(manager.instances_in_recovery().is_empty());
        assert_eq!(
            node_status.get_node(2).unwrap().inference_type,
            InferenceType::Unavailable
        );
        let commands = stub.commands.lock().unwrap();
        assert_eq!(commands.last().unwrap(), "STOP_ENGINE");
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_faults_before_readiness_never_recover() {
        let stub = start_node_manager_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let (manager, node_status) =
            build_manager(stub.port, &dir.path().join("faults.json"), 60);

        // Decode node exists but nothing is READY yet.
        let mut decode = ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1");
        decode.role_state = crate::node_status::ROLE_UNKNOWN.to_string();
        node_status.upsert(decode);

        let msg = switch_fault_msg("host-d", "t2");
        manager.process_fault_message(&msg).await;
        assert!(manager.instances_in_recovery().is_empty());
        assert!(stub.commands.lock().unwrap().is_empty());

        // Readiness arrives; the same fault id must stay inert.
        node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
        node_status.update_role_state(2, ROLE_READY);
        manager.process_fault_message(&msg).await;
        assert!(manager.instances_in_recovery().is_empty());
        assert!(stub.commands.lock().unwrap().is_empty());
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_critical_unhealthy_node_blacklists_instance() {
        let stub = start_node_manager_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let (manager, node_status) =
            build_manager(stub.port, &dir.path().join("faults.json"), 60);

        node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
        node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));

        let msg = FaultMsgSignal {
            node_fault_info: vec![NodeFaultInfo {
                node_ip: "host-d".to_string(),
                node_sn: "sn-1".to_string(),
                fault_level: "UnHealthy".to_string(),
                fault_device: vec![DeviceFault {
                    fault_level: "UnHealthy".to_string(),
                    fault_codes: vec!["DEADBEEF".to_string()],
                    fault_levels: vec!["L3".to_string()],
                    switch_fault_infos: Vec::new(),
                }],
            }],
        };
        manager.process_fault_message(&msg).await;

        assert!(manager.instances_in_recovery().is_empty());
        assert_eq!(
            node_status.get_node(2).unwrap().inference_type,
            InferenceType::Unavailable
        );
        let commands = stub.commands.lock().unwrap();
        assert_eq!(*commands, vec!["STOP_ENGINE"]);
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefill_single_node_uses_isolation() {
        let stub = start_node_manager_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let (manager, node_status) =
            build_manager(stub.port, &dir.path().join("faults.json"), 60);

        let mut prefill = ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1");
        prefill.is_single_node = true;
        node_status.upsert(prefill);
        node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));

        manager
            .process_fault_message(&switch_fault_msg("host-p", "t3"))
            .await;

        // Isolation: unavailable now, no engine commands, restored by timer.
        assert!(manager.instances_in_recovery().is_empty());
        assert_eq!(
            node_status.get_node(1).unwrap().inference_type,
            InferenceType::Unavailable
        );
        assert!(stub.commands.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(
            node_status.get_node(1).unwrap().inference_type,
            InferenceType::Available
        );
        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processed_faults_survive_restart() {
        let stub = start_node_manager_stub().await;
        let dir = tempfile::tempdir().unwrap();
        let faults_path = dir.path().join("faults.json");
        {
            let (manager, node_status) = build_manager(stub.port, &faults_path, 60);
            node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
            node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));
            manager
                .process_fault_message(&switch_fault_msg("host-d", "t4"))
                .await;
            assert_eq!(manager.processed_faults().len(), 1);
            manager.shutdown();
        }

        // A fresh manager loads the set and ignores the replayed fault.
        let (manager, node_status) = build_manager(stub.port, &faults_path, 60);
        node_status.upsert(ready_node(1, "host-p", InstanceRole::Prefill, "127.0.0.1"));
        node_status.upsert(ready_node(2, "host-d", InstanceRole::Decode, "127.0.0.1"));
        assert_eq!(manager.processed_faults().len(), 1);
        stub.commands.lock().unwrap().clear();
        manager
            .process_fault_message(&switch_fault_msg("host-d", "t4"))
            .await;
        assert!(manager.instances_in_recovery().is_empty());
        assert!(stub.commands.lock().unwrap().is_empty());
        manager.shutdown();
    }
}
