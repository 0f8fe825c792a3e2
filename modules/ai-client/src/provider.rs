use std::str::FromStr;

use crate::error::AiError;

const GROQ_API_URL: &str = "https://api.groq.com/openai/v1";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

/// OpenAI-compatible hosts the client knows how to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Groq,
    OpenRouter,
    /// Any other OpenAI-compatible endpoint (local proxies, test servers).
    Custom { base_url: String },
}

impl Provider {
    pub fn base_url(&self) -> &str {
        match self {
            Provider::Groq => GROQ_API_URL,
            Provider::OpenRouter => OPENROUTER_API_URL,
            Provider::Custom { base_url } => base_url.trim_end_matches('/'),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Groq => "meta-llama/llama-4-maverick-17b-128e-instruct",
            Provider::OpenRouter => "meta-llama/llama-4-maverick",
            Provider::Custom { .. } => "gpt-4o-mini",
        }
    }

    /// Reject keys that cannot possibly work before spending a request on them.
    pub fn validate_key(&self, api_key: &str) -> Result<(), AiError> {
        if api_key.trim().is_empty() {
            return Err(AiError::MissingApiKey);
        }
        if *self == Provider::Groq && !api_key.starts_with("gsk_") {
            return Err(AiError::InvalidApiKey(
                "Groq keys should start with \"gsk_\"".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromStr for Provider {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Ok(Provider::Groq),
            "openrouter" => Ok(Provider::OpenRouter),
            other if other.starts_with("http://") || other.starts_with("https://") => {
                Ok(Provider::Custom {
                    base_url: s.trim().to_string(),
                })
            }
            other => Err(AiError::Decode(format!("unknown provider: {other}"))),
        }
    }
}
