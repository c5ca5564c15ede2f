use std::collections::HashSet;

use infermesh_commons::models::cluster_wire::{
    InstanceRole,
    DECODE_INS_ID_TRANSFER_BY_FLEX,
};

/// In-memory record for one usable instance in the cluster view.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub role: InstanceRole,
    pub retry: usize,
    pub ip: String,
    pub port: String,
    pub model_name: String,
    pub tasks: HashSet<String>,
    pub metric_port: String,
    pub inter_comm_port: String,
    pub total_block_num: u64,
    pub total_slots_num: u64,
    pub virtual_id: u64,
}

impl InstanceInfo {
    pub fn new(ip: &str, port: &str, role: InstanceRole, model_name: &str) -> Self {
        Self {
            role,
            retry: 0,
            ip: ip.to_string(),
            port: port.to_string(),
            model_name: model_name.to_string(),
            tasks: HashSet::new(),
            metric_port: String::new(),
            inter_comm_port: String::new(),
            total_block_num: 0,
            total_slots_num: 0,
            virtual_id: 1,
        }
    }
}

/// Singleton describing the at-most-one Flex instance in the current view.
#[derive(Debug, Clone, Copy)]
pub struct FlexInstanceInfo {
    pub has_flex: bool,
    pub origin_flex_id: u64,
    pub p_percentage: u64,
    pub split_d_id: u64,
}

impl Default for FlexInstanceInfo {
    fn default() -> Self {
        Self {
            has_flex: false,
            origin_flex_id: 0,
            p_percentage: 0,
            split_d_id: DECODE_INS_ID_TRANSFER_BY_FLEX,
        }
    }
}
