use thiserror::Error;

/// Failures surfaced by [`crate::KvStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no leader available")]
    NoLeader,
    /// The worker refused a proposal because leadership moved. Callers retry
    /// through the forwarding path.
    #[error("this node is not the leader")]
    NotLeader,
    #[error("consensus did not commit in time")]
    Timeout,
    #[error("remote call failed with code {code}: {message}")]
    Remote { code: String, message: String },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("raft worker stopped")]
    Shutdown,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn remote(code: impl Into<String>, message: impl ToString) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.to_string(),
        }
    }
}
