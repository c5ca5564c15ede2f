use std::collections::{
    BTreeMap,
    HashSet,
};
use std::sync::RwLock;
use std::time::Instant;

use infermesh_commons::models::cluster_wire::{
    InstanceRole,
    DECODE_INS_ID_TRANSFER_BY_FLEX,
    FLEX_P_PERCENTAGE_MAX,
};
use infermesh_commons::utils::config::DeployMode;
use tracing::{
    debug,
    info,
    warn,
};

use crate::instance::{
    FlexInstanceInfo,
    InstanceInfo,
};

/// Cluster-wide instance cap; a split Flex may exceed it by one for a tick.
pub const INS_NUM_MAX: usize = 4096;

/// Result of diffing the live id list against a freshly published one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollResult {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

/// Per-instance occupancy snapshot handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlotInfo {
    pub id: u64,
    pub allocated_slots: u64,
    pub allocated_blocks: u64,
}

#[derive(Default)]
struct Inner {
    ids: Vec<u64>,
    infos: BTreeMap<u64, InstanceInfo>,
    virtual_to_ids: BTreeMap<u64, HashSet<u64>>,
    flex: FlexInstanceInfo,
    fault_virtual_ids: HashSet<u64>,
    fault_ids: HashSet<u64>,
    virtual_fault_time: BTreeMap<u64, Instant>,
    id_fault_time: BTreeMap<u64, Instant>,
}

/// In-memory source of truth for who is reachable, their role and task load.
///
/// A single lock guards the whole table; read accessors return owned copies
/// so no caller iterates while holding the lock.
pub struct ClusterNodes {
    deploy_mode: DeployMode,
    inner: RwLock<Inner>,
}

impl ClusterNodes {
    pub fn new(deploy_mode: DeployMode) -> Self {
        Self {
            deploy_mode,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn deploy_mode(&self) -> DeployMode {
        self.deploy_mode
    }

    pub fn add_instance(
        &self, id: u64, ip: &str, port: &str, role: InstanceRole, model_name: &str,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.infos.contains_key(&id) {
            warn!(id, "add instance failed, duplicate instance id");
            return false;
        }
        inner
            .infos
            .insert(id, InstanceInfo::new(ip, port, role, model_name));
        inner.ids.push(id);
        info!(id, %ip, %port, ?role, "instance added");
        true
    }

    pub fn remove_instance(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = inner.ids.iter().position(|&existing| existing == id) {
            inner.ids.remove(pos);
        } else {
            return;
        }
        let removed = inner.infos.remove(&id);
        if let Some(info) = removed {
            info!(id, ip = %info.ip, port = %info.port, role = ?info.role, "instance removed");
        }
    }

    pub fn update_extra_info(
        &self, id: u64, metric_port: &str, inter_comm_port: &str, total_block_num: u64,
        total_slots_num: u64, virtual_id: u64,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(info) = inner.infos.get_mut(&id) else {
            warn!(id, "update extra info failed, unknown instance");
            return;
        };
        info.metric_port = metric_port.to_string();
        info.inter_comm_port = inter_comm_port.to_string();
        info.total_block_num = total_block_num;
        info.total_slots_num = total_slots_num;
        info.virtual_id = virtual_id;
        inner.virtual_to_ids.entry(virtual_id).or_default().insert(id);
    }

    pub fn has_instance(&self, id: u64) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.infos.contains_key(&id)
    }

    pub fn get_info(&self, id: u64) -> Option<InstanceInfo> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.infos.get(&id).cloned()
    }

    /// Snapshot of every instance, keyed by id.
    pub fn all_infos(&self) -> BTreeMap<u64, InstanceInfo> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.infos.clone()
    }

    pub fn ip(&self, id: u64) -> Option<String> {
        self.get_info(id).map(|info| info.ip)
    }

    pub fn port(&self, id: u64) -> Option<String> {
        self.get_info(id).map(|info| info.port)
    }

    pub fn inter_comm_port(&self, id: u64) -> Option<String> {
        self.get_info(id).map(|info| info.inter_comm_port)
    }

    pub fn role(&self, id: u64) -> InstanceRole {
        self.get_info(id)
            .map(|info| info.role)
            .unwrap_or(InstanceRole::Undefined)
    }

    pub fn model_name(&self, id: u64) -> Option<String> {
        self.get_info(id).map(|info| info.model_name)
    }

    pub fn id_of(&self, ip: &str, port: &str) -> Option<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .infos
            .iter()
            .find(|(_, info)| info.ip == ip && info.port == port)
            .map(|(&id, _)| id)
    }

    /// Diffs the ordered live id list against `new_ids`. Insertion order of
    /// `new_ids` is preserved in `added`.
    pub fn roll(&self, new_ids: &[u64]) -> RollResult {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut result = RollResult::default();
        for &id in new_ids {
            if inner.ids.contains(&id) {
                result.updated.push(id);
            } else {
                result.added.push(id);
            }
        }
        for &id in &inner.ids {
            if !new_ids.contains(&id) {
                result.removed.push(id);
            }
        }
        result
    }

    /// True iff the cluster can serve requests under the configured deploy
    /// mode: PD modes need at least one P and one D, anything else just a
    /// non-empty view.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if self.deploy_mode.is_pd() {
            let has_p = inner
                .infos
                .values()
                .any(|info| info.role == InstanceRole::Prefill);
            let has_d = inner
                .infos
                .values()
                .any(|info| info.role == InstanceRole::Decode);
            has_p && has_d
        } else {
            !inner.infos.is_empty()
        }
    }

    pub fn add_task(&self, id: u64, req_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = inner.infos.get_mut(&id) {
            info.tasks.insert(req_id.to_string());
        }
    }

    /// No-op on an unknown id or a req id the instance never carried.
    pub fn decrease_task(&self, id: u64, req_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = inner.infos.get_mut(&id) {
            info.tasks.remove(req_id);
        }
    }

    pub fn task_count(&self, id: u64) -> Option<usize> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.infos.get(&id).map(|info| info.tasks.len())
    }

    pub fn tasks_of(&self, id: u64) -> HashSet<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .infos
            .get(&id)
            .map(|info| info.tasks.clone())
            .unwrap_or_default()
    }

    pub fn add_retry(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = inner.infos.get_mut(&id) {
            info.retry += 1;
        }
    }

    pub fn retry_count(&self, id: u64) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.infos.get(&id).map(|info| info.retry).unwrap_or(0)
    }

    /// The instance with the fewest in-flight tasks; used for tokenizer
    /// dispatch.
    pub fn tokenizer_instance(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .infos
            .iter()
            .min_by_key(|(_, info)| info.tasks.len())
            .map(|(&id, _)| id)
    }

    // --- virtual-id fault tracking ---

    pub fn add_fault_node(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(virtual_id) = inner.infos.get(&id).map(|info| info.virtual_id) else {
            warn!(id, "add fault node failed, unknown instance");
            return;
        };
        let now = Instant::now();
        inner.fault_virtual_ids.insert(virtual_id);
        inner.fault_ids.insert(id);
        inner.virtual_fault_time.insert(virtual_id, now);
        inner.id_fault_time.insert(id, now);
    }

    /// Clears the whole virtual-id group the instance belongs to.
    pub fn remove_fault_node(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(virtual_id) = inner.infos.get(&id).map(|info| info.virtual_id) else {
            warn!(id, "remove fault node failed, unknown instance");
            return;
        };
        inner.virtual_fault_time.remove(&virtual_id);
        inner.fault_virtual_ids.remove(&virtual_id);
        let grouped = inner.virtual_to_ids.remove(&virtual_id).unwrap_or_default();
        for grouped_id in grouped {
            debug!(id = grouped_id, "instance restored, removed from fault tracking");
            inner.id_fault_time.remove(&grouped_id);
            inner.fault_ids.remove(&grouped_id);
        }
    }

    pub fn is_faulty_node(&self, id: u64) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.infos.get(&id) {
            Some(info) => inner.fault_virtual_ids.contains(&info.virtual_id),
            None => inner.fault_ids.contains(&id),
        }
    }

    pub fn fault_time(&self, id: u64) -> Option<Instant> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.infos.get(&id) {
            Some(info) => inner.virtual_fault_time.get(&info.virtual_id).copied(),
            None => inner.id_fault_time.get(&id).copied(),
        }
    }

    pub fn ids_of_virtual(&self, id: u64) -> HashSet<u64> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(info) = inner.infos.get(&id) else {
            return HashSet::new();
        };
        inner
            .virtual_to_ids
            .get(&info.virtual_id)
            .cloned()
            .unwrap_or_default()
    }

    // --- Flex singleton bookkeeping (the algebra itself lives in flex.rs) ---

    pub fn record_flex(&self, origin_flex_id: u64, p_percentage: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.flex = FlexInstanceInfo {
            has_flex: true,
            origin_flex_id,
            p_percentage,
            split_d_id: DECODE_INS_ID_TRANSFER_BY_FLEX,
        };
    }

    pub fn clear_flex(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.flex = FlexInstanceInfo::default();
    }

    pub fn flex_info(&self) -> FlexInstanceInfo {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.flex
    }

    pub fn has_flex(&self) -> bool {
        self.flex_info().has_flex
    }

    pub fn is_flex_split(&self) -> bool {
        let flex = self.flex_info();
        flex.has_flex && flex.p_percentage != 0 && flex.p_percentage != FLEX_P_PERCENTAGE_MAX
    }

    pub fn is_instance_from_flex(&self, id: u64) -> bool {
        let flex = self.flex_info();
        flex.has_flex && (id == flex.split_d_id || id == flex.origin_flex_id)
    }

    pub fn is_both_p_and_d_from_flex(&self, p_id: u64, d_id: u64) -> bool {
        let flex = self.flex_info();
        p_id == flex.origin_flex_id && d_id == flex.split_d_id
    }

    /// True when the id list covers both halves the Flex contributes.
    pub fn contains_flex_halves(&self, ids: &[u64]) -> bool {
        let flex = self.flex_info();
        let mut p_found = flex.p_percentage == 0;
        let mut d_found = flex.p_percentage == FLEX_P_PERCENTAGE_MAX;
        for &id in ids {
            if id == flex.origin_flex_id {
                p_found = true;
            }
            if id == flex.split_d_id {
                d_found = true;
            }
        }
        p_found && d_found
    }

    pub fn max_instances(&self) -> usize {
        if self.is_flex_split() {
            INS_NUM_MAX + 1
        } else {
            INS_NUM_MAX
        }
    }

    // --- translation between the synthetic Flex world and the real one ---

    /// Folds the synthetic split-D occupancy back into the origin Flex entry
    /// (split case), or renames the synthetic D back to the Flex id.
    pub fn proc_scheduler_info_under_flex(&self, infos: &mut Vec<ScheduleSlotInfo>) {
        let flex = self.flex_info();
        if !flex.has_flex {
            return;
        }
        if self.is_flex_split() {
            let Some(flex_pos) = infos.iter().position(|info| info.id == flex.origin_flex_id)
            else {
                warn!(id = flex.origin_flex_id, "flex instance missing from scheduler info");
                return;
            };
            let Some(split_pos) = infos.iter().position(|info| info.id == flex.split_d_id) else {
                warn!(id = flex.split_d_id, "split decode instance missing from scheduler info");
                return;
            };
            let split = infos[split_pos].clone();
            infos[flex_pos].allocated_slots += split.allocated_slots;
            infos[flex_pos].allocated_blocks += split.allocated_blocks;
            infos.remove(split_pos);
        } else if let Some(split) = infos.iter_mut().find(|info| info.id == flex.split_d_id) {
            split.id = flex.origin_flex_id;
        }
    }

    /// Expands or rewrites a node id list so the scheduler sees the
    /// synthetic instances.
    pub fn proc_instance_ids_under_flex(&self, node_ids: &mut Vec<u64>) {
        let flex = self.flex_info();
        if !flex.has_flex {
            return;
        }
        let found = node_ids.iter().position(|&id| id == flex.origin_flex_id);
        if self.is_flex_split() {
            if found.is_some() {
                node_ids.push(flex.split_d_id);
            }
            return;
        }
        if flex.p_percentage == 0 {
            if let Some(pos) = found {
                node_ids[pos] = flex.split_d_id;
            }
        }
    }

    /// Task count with both halves of a split Flex folded together.
    pub fn task_count_under_flex(&self, id: u64) -> Option<usize> {
        let flex = self.flex_info();
        if !flex.has_flex || id != flex.origin_flex_id {
            return self.task_count(id);
        }
        if self.is_flex_split() {
            let origin = self.task_count(flex.origin_flex_id).unwrap_or(0);
            let split = self.task_count(flex.split_d_id).unwrap_or(0);
            return Some(origin + split);
        }
        if flex.p_percentage == 0 {
            self.task_count(flex.split_d_id)
        } else {
            self.task_count(flex.origin_flex_id)
        }
    }

    /// Rewrites a task-query D id to the synthetic D when it names the Flex.
    pub fn proc_task_query_d_id_under_flex(&self, d_id: &mut u64) {
        let flex = self.flex_info();
        if flex.has_flex && *d_id == flex.origin_flex_id {
            *d_id = DECODE_INS_ID_TRANSFER_BY_FLEX;
        }
    }
}
