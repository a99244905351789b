use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// The error kinds the server distinguishes at its boundaries. The HTTP
/// layer maps each variant to a status code; the scheduler and trigger
/// engines record them on their execution rows.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Input or output failed schema validation. Never retried.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Missing or invalid API key or webhook signature.
    #[error("{0}")]
    Auth(String),

    /// Schedule or trigger budget exceeded.
    #[error("{0}")]
    RateLimit(String),

    /// The environment manager could not materialize an environment.
    #[error("environment build failed: {0}")]
    EnvironmentBuild(String),

    /// Worker subprocess crash or timeout.
    #[error("{0}")]
    Worker(String),

    /// Failed outbound delivery (notification webhook).
    #[error("{0}")]
    Transport(String),

    /// Database or filesystem failure.
    #[error("{0}")]
    Infrastructure(String),
}

impl ServerError {
    pub fn infra(err: impl std::fmt::Display) -> Self {
        ServerError::Infrastructure(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Infrastructure(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Infrastructure(err.to_string())
    }
}
