use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("duplicate instance id {0}")]
    DuplicateInstance(u64),

    #[error("instance {0} not found")]
    InstanceNotFound(u64),

    #[error("p_percentage {0} out of range [0, 100]")]
    PercentageOutOfRange(u64),

    #[error("flex instance {0} missing from published node id list")]
    FlexIdMissing(u64),

    #[error("instance count {0} exceeds the cluster cap {1}")]
    TooManyInstances(usize, usize),
}
