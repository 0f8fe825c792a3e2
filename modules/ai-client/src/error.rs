use thiserror::Error;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("No API key configured")]
    MissingApiKey,

    #[error("API key rejected before sending: {0}")]
    InvalidApiKey(String),

    #[error("API key is invalid or revoked (401): {0}")]
    Unauthorized(String),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Empty response from API")]
    EmptyResponse,

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        AiError::Network(err.to_string())
    }
}

impl AiError {
    /// Map a non-success HTTP status and body onto the error taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 401 {
            AiError::Unauthorized(body)
        } else {
            AiError::Api { status, body }
        }
    }
}
