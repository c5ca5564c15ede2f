use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("duplicate request id {0}")]
    DuplicateReqId(String),

    #[error("request {0} not found")]
    NotFound(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] infermesh_cluster::ClusterError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric text parse failed: {0}")]
    Parse(String),

    #[error("metric count differs between instances")]
    CountMismatch,

    #[error("metric pull from {addr} failed: {reason}")]
    Pull { addr: String, reason: String },

    #[error("no instances to collect metrics from")]
    NoInstances,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no schedulable instances")]
    NoInstances,

    #[error("scheduler rejected request: {0}")]
    Rejected(String),
}
