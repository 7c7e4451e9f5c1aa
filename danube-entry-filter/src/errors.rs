use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("entry filter {name} failed to close: {reason}")]
    Close { name: String, reason: String },

    #[error("isolation context {name} failed to release: {reason}")]
    Release { name: String, reason: String },
}
