use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("connection limit {0} reached")]
    TooManyConnections(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
