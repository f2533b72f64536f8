use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type EnsembleResult<T> = Result<T, EnsembleError>;
