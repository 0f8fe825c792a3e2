use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlopBlockError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
