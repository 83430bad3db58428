use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Resource accounting error: {0}")]
    ResourceError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<String> for SchedulerError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for SchedulerError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
