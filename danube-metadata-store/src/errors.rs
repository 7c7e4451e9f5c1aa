use serde_json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Watch stream error: {0}")]
    WatchError(String),

    #[error("Storage backend error: {0}")]
    StorageError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to connect to storage: {0}")]
    ConnectionError(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Lease {0} not found or expired")]
    LeaseNotFound(i64),

    #[error("Operation not supported by backend")]
    UnsupportedOperation,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

impl MetadataError {
    /// Errors that are worth retrying: the backend may recover on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MetadataError::StorageError(_)
                | MetadataError::ConnectionError(_)
                | MetadataError::WatchError(_)
        )
    }
}

// Convenience impl for etcd errors
impl From<etcd_client::Error> for MetadataError {
    fn from(err: etcd_client::Error) -> Self {
        MetadataError::StorageError(Box::new(err))
    }
}
