use crate::guard::Rejection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Rejected query: {0}")]
    Rejected(Rejection),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Execution(err.to_string())
    }
}

impl From<Rejection> for PipelineError {
    fn from(rejection: Rejection) -> Self {
        PipelineError::Rejected(rejection)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
