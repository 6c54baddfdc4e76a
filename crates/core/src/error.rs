use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid EIN: {0}")]
    InvalidEin(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("CAPTCHA_BLOCKED: {0}")]
    CaptchaBlocked(String),

    #[error("phase {phase} failed: {message}")]
    Phase { phase: String, message: String },

    #[error("export error: {0}")]
    Export(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Permanent errors are never retried; the row stays failed with the
    /// message so later runs skip it instead of burning retries on it.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::InvalidEin(_))
    }
}
