use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to launch worker for '{source_name}': {message}")]
    JobLaunch {
        source_name: String,
        message: String,
    },

    #[error("stage '{stage}' timed out after {waited_secs}s")]
    StageTimeout { stage: String, waited_secs: u64 },

    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
