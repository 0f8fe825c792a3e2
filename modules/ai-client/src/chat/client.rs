use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::*;
use crate::error::{AiError, Result};
use crate::provider::Provider;
use crate::traits::{ChatModel, Message};
use crate::util::truncate_to_char_boundary;

const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chat-completions client for any OpenAI-compatible provider.
#[derive(Clone)]
pub struct ChatClient {
    provider: Provider,
    api_key: String,
    model: String,
    max_tokens: u32,
    http: reqwest::Client,
    app_name: Option<String>,
}

impl ChatClient {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            model: provider.default_model().to_string(),
            provider,
            api_key: api_key.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            http,
            app_name: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sent as `X-Title`; OpenRouter uses it for attribution.
    pub fn with_app_name(mut self, name: &str) -> Self {
        self.app_name = Some(name.to_string());
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| AiError::InvalidApiKey(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(ref name) = self.app_name {
            if let Ok(val) = HeaderValue::from_str(name) {
                headers.insert("X-Title", val);
            }
        }

        Ok(headers)
    }

    fn request(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.into_iter().map(WireMessage::from).collect(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat::json_object(),
        }
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn json_completion(&self, messages: Vec<Message>) -> Result<String> {
        self.provider.validate_key(&self.api_key)?;

        let url = format!("{}/chat/completions", self.provider.base_url());
        let request = self.request(messages);

        debug!(model = %request.model, messages = request.messages.len(), "Chat completion request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(
                status = status.as_u16(),
                body = truncate_to_char_boundary(&body, 300),
                "Chat completion returned non-success"
            );
            return Err(AiError::from_status(status.as_u16(), body));
        }

        parse_completion(&body)
    }
}

/// Pull the first choice's content out of a raw chat-completions body.
pub(crate) fn parse_completion(body: &str) -> Result<String> {
    if body.trim().is_empty() {
        return Err(AiError::EmptyResponse);
    }

    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| AiError::Decode(e.to_string()))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(AiError::EmptyResponse)
}
