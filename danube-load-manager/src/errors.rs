use danube_metadata_store::MetadataError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoadManagerError>;

#[derive(Debug, Error)]
pub enum LoadManagerError {
    #[error("invalid load balancer configuration: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    Store(#[from] MetadataError),

    #[error("unable to (de)serialize load data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation not allowed in state {state}: {operation}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("cycle aborted: {0}")]
    Aborted(String),
}

impl LoadManagerError {
    /// Worth retrying, the store may recover before the attempts are exhausted.
    pub fn is_transient(&self) -> bool {
        match self {
            LoadManagerError::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}
