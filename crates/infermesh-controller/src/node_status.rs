use std::collections::HashSet;

use infermesh_commons::models::cluster_wire::{
    DynamicInfo,
    InstanceRole,
    StaticInfo,
};
use infermesh_commons::utils::concurrent::Registry;
use serde::{
    Deserialize,
    Serialize,
};

// Role-state strings as the workers report them. The comparison is exact;
// any other value leaves the worker counted as still running.
pub const ROLE_READY: &str = "RoleReady";
pub const ROLE_UNKNOWN: &str = "RoleUnknown";
pub const ROLE_SWITCHING: &str = "RoleSwitching";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceType {
    Available,
    Unavailable,
}

impl Default for InferenceType {
    fn default() -> Self {
        InferenceType::Available
    }
}

/// Controller-side record for one worker node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub id: u64,
    /// Pod endpoint the node-manager listens on.
    pub ip: String,
    /// Host address ClusterD reports faults against.
    pub host_id: String,
    pub port: String,
    pub metric_port: String,
    pub inter_comm_port: String,
    pub model_name: String,
    pub role: InstanceRole,
    pub role_state: String,
    pub inference_type: InferenceType,
    pub is_single_node: bool,
    pub is_healthy: bool,
    pub is_initialized: bool,
    /// Peer set defining the data-parallel group; its minimum is the
    /// canonical instance id.
    pub dp_group_peers: Vec<u64>,
    pub peers: Vec<u64>,
    pub active_peers: Vec<u64>,
    pub static_info: StaticInfo,
    pub dynamic_info: DynamicInfo,
}

/// Registry of all known worker nodes; reads hand out clones.
#[derive(Default)]
pub struct NodeStatus {
    nodes: Registry<u64, NodeInfo>,
}

impl NodeStatus {
    pub fn new() -> Self {
        Self {
            nodes: Registry::new(),
        }
    }

    pub fn upsert(&self, node: NodeInfo) {
        self.nodes.set(node.id, node);
    }

    pub fn remove(&self, id: u64) {
        self.nodes.remove(&id);
    }

    pub fn get_node(&self, id: u64) -> Option<NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn all_node_ids(&self) -> Vec<u64> {
        self.nodes.keys()
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.all_node_ids()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .collect()
    }

    pub fn update_inference_type(&self, id: u64, inference_type: InferenceType) {
        self.nodes.update(&id, |node| {
            node.inference_type = inference_type;
        });
    }

    pub fn update_role_state(&self, id: u64, role_state: &str) {
        self.nodes.update(&id, |node| {
            node.role_state = role_state.to_string();
        });
    }

    pub fn find_node_by_host(&self, host: &str) -> Option<u64> {
        self.all_nodes()
            .into_iter()
            .find(|node| node.host_id == host)
            .map(|node| node.id)
    }

    /// Canonical instance id of a node: min of its dp-group peers, or the
    /// node id itself when the group is empty.
    pub fn instance_id_of(&self, node: &NodeInfo) -> u64 {
        node.dp_group_peers.iter().min().copied().unwrap_or(node.id)
    }

    pub fn nodes_in_instance(&self, instance_id: u64) -> Vec<u64> {
        self.all_nodes()
            .into_iter()
            .filter(|node| self.instance_id_of(node) == instance_id)
            .map(|node| node.id)
            .collect()
    }

    pub fn pod_ips_in_instance(&self, instance_id: u64) -> HashSet<String> {
        self.all_nodes()
            .into_iter()
            .filter(|node| self.instance_id_of(node) == instance_id && !node.ip.is_empty())
            .map(|node| node.ip)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn node(id: u64, host: &str, peers: Vec<u64>) -> NodeInfo {
        NodeInfo {
            id,
            ip: format!("10.1.0.{id}"),
            host_id: host.to_string(),
            role: InstanceRole::Decode,
            role_state: ROLE_READY.to_string(),
            dp_group_peers: peers,
            ..NodeInfo::default()
        }
    }

    #[test]
    fn test_instance_grouping_by_min_peer() {
        let status = NodeStatus::new();
        status.upsert(node(3, "h3", vec![3, 4]));
        status.upsert(node(4, "h4", vec![3, 4]));
        status.upsert(node(9, "h9", vec![]));

        assert_eq!(status.nodes_in_instance(3).len(), 2);
        assert_eq!(status.nodes_in_instance(9), vec![9]);
        let ips = status.pod_ips_in_instance(3);
        assert!(ips.contains("10.1.0.3"));
        assert!(ips.contains("10.1.0.4"));
    }

    #[test]
    fn test_find_by_host_and_availability_flip() {
        let status = NodeStatus::new();
        status.upsert(node(7, "host-a", vec![]));
        assert_eq!(status.find_node_by_host("host-a"), Some(7));
        assert_eq!(status.find_node_by_host("host-b"), None);

        status.update_inference_type(7, InferenceType::Unavailable);
        assert_eq!(
            status.get_node(7).unwrap().inference_type,
            InferenceType::Unavailable
        );
    }
}
