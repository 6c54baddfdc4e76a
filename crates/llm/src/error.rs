use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("config error: {0}")]
    Config(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("model returned no candidates")]
    Empty,

    #[error("model output is not valid JSON: {0}")]
    UnparseableJson(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;
