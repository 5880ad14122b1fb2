use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No suitable instances found for service: {0}")]
    NoSuitableInstances(String),

    #[error("Discovery store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Registration-time validation failures are never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::InvalidConfiguration(_))
    }
}
