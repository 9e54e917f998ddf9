use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM not configured (set OPENAI_API_KEY)")]
    NotConfigured,

    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}
