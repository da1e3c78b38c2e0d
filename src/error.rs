use thiserror::Error;

pub type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("threat detected: {0}")]
    ThreatDetected(String),

    #[error("rate limit exceeded for {identity}")]
    RateLimitExceeded { identity: String },

    #[error("client {0} is blocklisted")]
    Blocklisted(String),

    #[error("request of {size} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { size: u64, limit: u64 },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SecurityError {
    /// HTTP status an upstream handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SecurityError::RateLimitExceeded { .. } => 429,
            SecurityError::RequestTooLarge { .. } => 413,
            SecurityError::Config(_) | SecurityError::Io(_) | SecurityError::Yaml(_) => 500,
            _ => 403,
        }
    }
}
