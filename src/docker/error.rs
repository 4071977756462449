//! Error type for daemon interactions.

use thiserror::Error;

/// Single error surface of the container driver.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("image build failed: {0}")]
    BuildFailed(String),
    #[error("Docker API error: {0}")]
    Api(String),
    #[error("Docker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for DockerError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => DockerError::NotFound(message),
            other => DockerError::Api(other.to_string()),
        }
    }
}
