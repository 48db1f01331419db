use thiserror::Error;

/// Block-level errors
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Reference not found: {0}")]
    Resolution(String),
    #[error("Invalid block parameters: {0}")]
    InvalidParams(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Timeout: block execution exceeded {0}s")]
    Timeout(u64),
    #[error("Expression error: {0}")]
    Expression(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("No workflow source configured for sub-workflow execution")]
    MissingWorkflowSource,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BlockError {
    fn from(e: serde_json::Error) -> Self {
        BlockError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for BlockError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BlockError::Timeout(0)
        } else {
            BlockError::Http(e.to_string())
        }
    }
}
