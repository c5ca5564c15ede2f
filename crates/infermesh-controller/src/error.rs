use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("node manager request to {addr} failed: {reason}")]
    NodeManager { addr: String, reason: String },

    #[error("persistence failed: {0}")]
    Persist(#[from] std::io::Error),

    #[error("invalid persisted state: {0}")]
    PersistFormat(#[from] serde_json::Error),

    #[error("shared memory setup failed: {0}")]
    Shm(String),
}
