use serde::{
    Deserialize,
    Serialize,
};

/// Reserved id of the Decode half carved out of a split Flex instance.
pub const DECODE_INS_ID_TRANSFER_BY_FLEX: u64 = u64::MAX - 1;
/// Upper bound of the Flex prefill percentage.
pub const FLEX_P_PERCENTAGE_MAX: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceRole {
    #[serde(rename = "P")]
    Prefill,
    #[serde(rename = "D")]
    Decode,
    #[serde(rename = "M")]
    Flex,
    #[serde(rename = "U")]
    Undefined,
}

impl Default for InstanceRole {
    fn default() -> Self {
        InstanceRole::Undefined
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLabel {
    PrefillStatic,
    DecodeStatic,
    FlexStatic,
    Undefined,
}

impl Default for InstanceLabel {
    fn default() -> Self {
        InstanceLabel::Undefined
    }
}

/// Static half of a published instance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticInfo {
    pub group_id: u64,
    pub max_seq_len: u64,
    pub virtual_id: u64,
    pub max_output_len: u64,
    pub total_slots_num: u64,
    pub total_block_num: u64,
    pub block_size: u64,
    pub label: InstanceLabel,
    pub role: InstanceRole,
    pub p_percentage: u64,
}

/// Dynamic half of a published instance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicInfo {
    pub avail_slots_num: u64,
    pub avail_block_num: u64,
    pub waiting_request_num: u64,
    pub running_request_num: u64,
    pub swapped_request_num: u64,
    pub free_npu_block_nums: u64,
    pub free_cpu_block_nums: u64,
    pub total_npu_block_nums: u64,
    pub total_cpu_block_nums: u64,
    pub peers: Vec<u64>,
}

/// One entry of the `instances` array in the refresh body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeEntry {
    pub id: u64,
    pub ip: String,
    pub port: String,
    pub model_name: String,
    pub metric_port: String,
    pub inter_comm_port: String,
    pub static_info: StaticInfo,
    pub dynamic_info: DynamicInfo,
}

/// Body of `POST /v1/refresh`: the authoritative cluster view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterViewBody {
    pub instances: Vec<NodeEntry>,
    pub ids: Vec<u64>,
}

/// Body of `POST /v1/terminate-service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateServiceBody {
    pub ip: String,
    pub port: String,
}
