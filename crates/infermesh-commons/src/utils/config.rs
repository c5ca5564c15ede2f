use std::path::Path;

use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

/// Environment variable selecting the controller config file.
pub const CONTROLLER_CONFIG_ENV: &str = "MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH";
/// Environment override for the reported model id.
pub const MODEL_ID_ENV: &str = "MODEL_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("{0} is not set")]
    MissingEnv(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    PdSeparate,
    PdDisaggregation,
    PdDisaggregationSingleContainer,
    SingleNode,
}

impl DeployMode {
    /// True for every mode that routes a request through a (P, D) pair.
    pub fn is_pd(self) -> bool {
        !matches!(self, DeployMode::SingleNode)
    }
}

impl Default for DeployMode {
    fn default() -> Self {
        DeployMode::PdSeparate
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen_ip: String,
    pub listen_port: u16,
    pub deploy_mode: DeployMode,
    pub max_reqs: usize,
    pub schedule_timeout_secs: u64,
    pub first_token_timeout_secs: u64,
    pub infer_timeout_secs: u64,
    pub tokenizer_timeout_secs: u64,
    pub max_retry: usize,
    pub http_timeout_secs: u64,
    pub client_thread_num: usize,
    pub connection_pool_max_conn: usize,
    pub conn_idle_timeout_secs: u64,
    pub str_token_rate: f64,
    pub metrics_reuse_secs: u64,
    pub controller_ip: String,
    pub controller_alarm_port: u16,
    pub backup_enabled: bool,
    pub is_master: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 1025,
            deploy_mode: DeployMode::PdSeparate,
            max_reqs: 5000,
            schedule_timeout_secs: 120,
            first_token_timeout_secs: 600,
            infer_timeout_secs: 600,
            tokenizer_timeout_secs: 600,
            max_retry: 3,
            http_timeout_secs: 10,
            client_thread_num: 4,
            connection_pool_max_conn: 4096,
            conn_idle_timeout_secs: 0,
            str_token_rate: 1.5,
            metrics_reuse_secs: 1,
            controller_ip: "127.0.0.1".to_string(),
            controller_alarm_port: 1027,
            backup_enabled: false,
            is_master: true,
            tls: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub prefill_isolation_secs: u64,
    pub processed_faults_path: String,
    pub check_mounted_files: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 1,
            poll_timeout_secs: 60,
            prefill_isolation_secs: 52,
            processed_faults_path: "processed_switch_faults.json".to_string(),
            check_mounted_files: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_ip: String,
    pub listen_port: u16,
    pub coordinator_ips: Vec<String>,
    pub coordinator_port: u16,
    pub coordinator_external_port: u16,
    pub node_manager_port: u16,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub sync_interval_secs: u64,
    pub deploy_mode: DeployMode,
    pub backup_enabled: bool,
    pub recovery: RecoveryConfig,
    pub tls: Option<TlsConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 1026,
            coordinator_ips: Vec::new(),
            coordinator_port: 1025,
            coordinator_external_port: 1025,
            node_manager_port: 1028,
            http_timeout_secs: 10,
            http_retries: 3,
            sync_interval_secs: 5,
            deploy_mode: DeployMode::PdSeparate,
            backup_enabled: false,
            recovery: RecoveryConfig::default(),
            tls: None,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path)
    }

    /// Loads the config from the path named by
    /// `MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH`.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONTROLLER_CONFIG_ENV)
            .map_err(|_| ConfigError::MissingEnv(CONTROLLER_CONFIG_ENV))?;
        Self::load(path)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
