use common::{BrokerError, IdentityError};

/// Failures of commander operations, grouped the way callers react to them.
#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    /// Malformed or incomplete request. Never retried.
    #[error("{0}")]
    Validation(String),
    /// Bad shared secret or failed token verification.
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    /// The worker-specific queue could not be declared.
    #[error("routing failed: {0}")]
    Routing(#[source] BrokerError),
    #[error("publish failed: {0}")]
    Publish(#[source] BrokerError),
    #[error("encode failed: {0}")]
    Encode(#[from] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IdentityError> for MissionError {
    fn from(e: IdentityError) -> Self {
        MissionError::Validation(e.to_string())
    }
}

impl MissionError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            MissionError::Validation(_) => "validation_error",
            MissionError::Forbidden => "forbidden",
            MissionError::NotFound(_) => "not_found",
            MissionError::Routing(_) => "routing_error",
            MissionError::Publish(_) => "publish_error",
            MissionError::Encode(_) => "encode_error",
            MissionError::Internal(_) => "internal_error",
        }
    }
}
