use thiserror::Error;

pub type MailflowResult<T> = Result<T, MailflowError>;

#[derive(Error, Debug)]
pub enum MailflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MailflowError {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        MailflowError::NotFound(format!("{kind} {id}"))
    }

    /// Rejected input that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MailflowError::Validation(_) | MailflowError::MissingVariable(_)
        )
    }
}

impl From<config::ConfigError> for MailflowError {
    fn from(err: config::ConfigError) -> Self {
        MailflowError::Config(err.to_string())
    }
}
