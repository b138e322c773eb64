use async_openai::error::OpenAIError;
use thiserror::Error;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Rerank error: {0}")]
    Rerank(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
