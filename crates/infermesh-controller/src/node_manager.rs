//! Commands toward the worker-side node-manager agent. Every call builds
//! its own HTTP client; commands are fanned out one client per target.

use std::time::Duration;

use serde_json::json;
use tracing::{
    error,
    info,
};

use crate::error::ControllerError;

const STOP_ENGINE_TIMEOUT_SECS: u64 = 10;
const ENGINE_CMD_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeManagerCmd {
    PauseEngine,
    ReinitNpu,
    StartEngine,
    StopEngine,
}

impl NodeManagerCmd {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeManagerCmd::PauseEngine => "PAUSE_ENGINE",
            NodeManagerCmd::ReinitNpu => "REINIT_NPU",
            NodeManagerCmd::StartEngine => "START_ENGINE",
            NodeManagerCmd::StopEngine => "STOP_ENGINE",
        }
    }

    fn timeout(self) -> Duration {
        match self {
            NodeManagerCmd::StopEngine => Duration::from_secs(STOP_ENGINE_TIMEOUT_SECS),
            _ => Duration::from_secs(ENGINE_CMD_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuStatus {
    Ready,
    Init,
    Normal,
    Pause,
    Abnormal,
    Unknown,
}

impl NpuStatus {
    pub fn parse(text: &str) -> Self {
        match text {
            "ready" => NpuStatus::Ready,
            "init" => NpuStatus::Init,
            "normal" => NpuStatus::Normal,
            "pause" => NpuStatus::Pause,
            "abnormal" => NpuStatus::Abnormal,
            _ => NpuStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeManagerSender {
    port: u16,
    status_timeout: Duration,
}

impl NodeManagerSender {
    pub fn new(port: u16, status_timeout: Duration) -> Self {
        Self {
            port,
            status_timeout,
        }
    }

    pub async fn send_command(
        &self, node_ip: &str, cmd: NodeManagerCmd,
    ) -> Result<(), ControllerError> {
        let addr = format!("http://{}:{}/fault-command", node_ip, self.port);
        let client = reqwest::Client::new();
        let response = client
            .post(&addr)
            .timeout(cmd.timeout())
            .json(&json!({ "cmd": cmd.as_str() }))
            .send()
            .await
            .map_err(|e| ControllerError::NodeManager {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            error!(%addr, cmd = cmd.as_str(), status = %response.status(),
                "node manager rejected command");
            return Err(ControllerError::NodeManager {
                addr,
                reason: format!("status {}", response.status()),
            });
        }
        info!(%addr, cmd = cmd.as_str(), "node manager command acknowledged");
        Ok(())
    }

    pub async fn node_status(&self, node_ip: &str) -> Result<NpuStatus, ControllerError> {
        if node_ip.is_empty() {
            return Err(ControllerError::NodeManager {
                addr: String::new(),
                reason: "node manager ip is empty".to_string(),
            });
        }
        let addr = format!("http://{}:{}/node-status", node_ip, self.port);
        let client = reqwest::Client::new();
        let response = client
            .get(&addr)
            .timeout(self.status_timeout)
            .send()
            .await
            .map_err(|e| ControllerError::NodeManager {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ControllerError::NodeManager {
                addr,
                reason: format!("status {}", response.status()),
            });
        }
        let body: serde_json::Value =
            response.json().await.map_err(|e| ControllerError::NodeManager {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let status = body
            .get("status")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ControllerError::NodeManager {
                addr,
                reason: "missing status field".to_string(),
            })?;
        Ok(NpuStatus::parse(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_wire_names() {
        assert_eq!(NodeManagerCmd::PauseEngine.as_str(), "PAUSE_ENGINE");
        assert_eq!(NodeManagerCmd::ReinitNpu.as_str(), "REINIT_NPU");
        assert_eq!(NodeManagerCmd::StartEngine.as_str(), "START_ENGINE");
        assert_eq!(NodeManagerCmd::StopEngine.as_str(), "STOP_ENGINE");
    }

    #[test]
    fn test_stop_engine_has_short_timeout() {
        assert_eq!(NodeManagerCmd::StopEngine.timeout(), Duration::from_secs(10));
        assert_eq!(NodeManagerCmd::ReinitNpu.timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(NpuStatus::parse("ready"), NpuStatus::Ready);
        assert_eq!(NpuStatus::parse("pause"), NpuStatus::Pause);
        assert_eq!(NpuStatus::parse("whatever"), NpuStatus::Unknown);
    }
}
