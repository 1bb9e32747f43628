use thiserror::Error;

/// Unified application error type to simplify bubbling errors through async flows.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading the submissions export. {0}")]
    Csv(#[from] csv::Error),
    #[error("Error handling the database. {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error communicating with the AI. {0}")]
    AIClient(#[from] async_openai::error::OpenAIError),
    #[error("Error while writing information to a string. {0}")]
    BufferWrite(#[from] std::fmt::Error),
    #[error("Linear algebra failure. {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error("Clustering failed. {0}")]
    Clustering(String),
    #[error("Input is degenerate. {0}")]
    DegenerateInput(String),
    #[error("No clustering configuration satisfied the target range. {0}")]
    NoSatisfyingConfiguration(String),
    #[error("Embedding response did not match the request. {0}")]
    EmbeddingShape(String),
    #[error("Error parsing the duration string. {0}")]
    DurationParse(#[from] humantime::DurationError),
    #[error("Error formatting a timestamp. {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Directory not found error. {0}")]
    Dirs(#[from] feedback_atlas_dirs::DirError),
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;
