use serde::{
    Deserialize,
    Serialize,
};

/// One switch-level fault entry reported by ClusterD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchFaultInfo {
    #[serde(rename = "faultCode")]
    pub fault_code: String,
    #[serde(rename = "switchChipId")]
    pub switch_chip_id: String,
    #[serde(rename = "switchPortId")]
    pub switch_port_id: String,
    #[serde(rename = "faultTime")]
    pub fault_time: String,
}

impl SwitchFaultInfo {
    /// Dedup key across restarts: `faultCode|chipId|portId|faultTime`.
    pub fn unique_id(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.fault_code, self.switch_chip_id, self.switch_port_id, self.fault_time
        )
    }
}

/// Per-device fault block. `fault_codes` and `fault_levels` are parallel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFault {
    #[serde(rename = "faultlevel")]
    pub fault_level: String,
    #[serde(rename = "faultCodes")]
    pub fault_codes: Vec<String>,
    #[serde(rename = "faultlevels")]
    pub fault_levels: Vec<String>,
    #[serde(rename = "switchFaultInfos")]
    pub switch_fault_infos: Vec<SwitchFaultInfo>,
}

/// Per-node fault block. `fault_level` is "Healthy" or "UnHealthy".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFaultInfo {
    #[serde(rename = "nodeIp")]
    pub node_ip: String,
    #[serde(rename = "nodeSn")]
    pub node_sn: String,
    #[serde(rename = "faultlevel")]
    pub fault_level: String,
    #[serde(rename = "faultDevice")]
    pub fault_device: Vec<DeviceFault>,
}

/// The fault envelope consumed by the recovery manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultMsgSignal {
    #[serde(rename = "nodeFaultInfo")]
    pub node_fault_info: Vec<NodeFaultInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_layout() {
        let fault = SwitchFaultInfo {
            fault_code: "[0x08520003,na,L2,na]".to_string(),
            switch_chip_id: "3".to_string(),
            switch_port_id: "12".to_string(),
            fault_time: "1712000000".to_string(),
        };
        assert_eq!(fault.unique_id(), "[0x08520003,na,L2,na]|3|12|1712000000");
    }

    #[test]
    fn test_envelope_field_names() {
        let raw = r#"{
            "nodeFaultInfo": [{
                "nodeIp": "10.1.0.2",
                "nodeSn": "sn-1",
                "faultlevel": "Healthy",
                "faultDevice": [{
                    "faultlevel": "UnHealthy",
                    "faultCodes": ["80CB8009"],
                    "faultlevels": ["NotHandleFault"],
                    "switchFaultInfos": [{
                        "faultCode": "[0x08520003,na,L2,na]",
                        "switchChipId": "0",
                        "switchPortId": "1",
                        "faultTime": "t0"
                    }]
                }]
            }]
        }"#;
        let msg: FaultMsgSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.node_fault_info.len(), 1);
        let node = &msg.node_fault_info[0];
        assert_eq!(node.fault_level, "Healthy");
        assert_eq!(node.fault_device[0].switch_fault_infos[0].switch_port_id, "1");
    }
}
