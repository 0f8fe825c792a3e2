//! Remote classifier backed by a chat-completions model.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info};

use ai_client::util::{parse_json_lenient, truncate_to_char_boundary};
use ai_client::{ChatClient, ChatModel, Message, StructuredOutput};
use slopblock_common::RemoteVerdict;

use crate::dispatcher::{ClassifyError, ClassifyRequest, RemoteClassifier};

/// Shape the model is asked to answer with.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct BatchVerdicts {
    /// One entry per post, `id` being the post's number in the list.
    pub results: Vec<RemoteVerdict>,
}

pub struct LlmClassifier {
    model: Arc<dyn ChatModel>,
}

impl LlmClassifier {
    pub fn new(client: ChatClient) -> Self {
        Self::from_model(Arc::new(client))
    }

    pub fn from_model(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

fn system_message(prompt_context: &str) -> String {
    let schema = serde_json::to_string_pretty(&BatchVerdicts::prompt_schema()).unwrap_or_default();
    format!(
        "{prompt_context}\n\n\
         Respond with a single JSON object and nothing else. \
         Include one entry in \"results\" for every post, using the post's number as \"id\".\n\n\
         JSON schema:\n{schema}"
    )
}

fn user_message(texts: &[String]) -> String {
    let posts = texts
        .iter()
        .enumerate()
        .map(|(i, text)| format!("{i}: {text}"))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Analyze these {} posts and decide for each whether it is slop.\n\nPosts:\n{posts}",
        texts.len()
    )
}

/// Parse model output into verdicts. Anything without a `results` array is
/// malformed.
pub fn parse_verdicts(content: &str) -> Result<Vec<RemoteVerdict>, ClassifyError> {
    let value = parse_json_lenient(content).ok_or_else(|| {
        ClassifyError::Malformed(format!(
            "not JSON: {}",
            truncate_to_char_boundary(content, 200)
        ))
    })?;

    if !value.get("results").is_some_and(|r| r.is_array()) {
        return Err(ClassifyError::Malformed(
            "missing results array".to_string(),
        ));
    }

    let parsed: BatchVerdicts =
        serde_json::from_value(value).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    Ok(parsed.results)
}

#[async_trait]
impl RemoteClassifier for LlmClassifier {
    async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> Result<Vec<RemoteVerdict>, ClassifyError> {
        if request.texts.is_empty() {
            return Ok(Vec::new());
        }

        let messages = vec![
            Message::system(system_message(&request.prompt_context)),
            Message::user(user_message(&request.texts)),
        ];

        debug!(posts = request.texts.len(), "Sending batch to remote classifier");
        let content = self.model.json_completion(messages).await?;
        let verdicts = parse_verdicts(&content)?;

        info!(
            posts = request.texts.len(),
            verdicts = verdicts.len(),
            flagged = verdicts.iter().filter(|v| v.is_slop).count(),
            "Remote batch classified"
        );
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_client::{AiError, Provider};
    use std::sync::Mutex;

    struct FakeModel {
        reply: std::result::Result<String, u16>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl FakeModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(status),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        async fn json_completion(&self, messages: Vec<Message>) -> ai_client::Result<String> {
            self.seen.lock().unwrap().push(messages);
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(status) => Err(AiError::from_status(*status, "nope".into())),
            }
        }
    }

    fn request(texts: &[&str]) -> ClassifyRequest {
        ClassifyRequest {
            texts: texts.iter().map(|t| t.to_string()).collect(),
            prompt_context: "Be strict.".into(),
        }
    }

    #[tokio::test]
    async fn builds_numbered_prompt_and_parses_results() {
        let model = FakeModel::replying(
            r#"{"results":[{"id":0,"isSlop":false,"confidence":0.1},{"id":1,"isSlop":true,"confidence":0.95}]}"#,
        );
        let classifier = LlmClassifier::from_model(model.clone());

        let verdicts = classifier
            .classify(&request(&["hello", "buy my course"]))
            .await
            .unwrap();
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts[1].is_slop);

        let seen = model.seen.lock().unwrap();
        let messages = &seen[0];
        assert!(messages[0].content.starts_with("Be strict."));
        assert!(messages[0].content.contains("isSlop"));
        assert!(messages[1].content.contains("0: hello\n\n1: buy my course"));
        assert!(messages[1].content.contains("these 2 posts"));
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let model = FakeModel::replying("```json\n{\"results\":[{\"id\":0,\"isSlop\":true}]}\n```");
        let verdicts = LlmClassifier::from_model(model)
            .classify(&request(&["x"]))
            .await
            .unwrap();
        assert_eq!(verdicts[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn missing_results_is_malformed() {
        let model = FakeModel::replying(r#"{"verdicts":[]}"#);
        let err = LlmClassifier::from_model(model)
            .classify(&request(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Malformed(_)));
    }

    #[tokio::test]
    async fn unauthorized_surfaces_as_transport_error() {
        let err = LlmClassifier::from_model(FakeModel::failing(401))
            .classify(&request(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Transport(AiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn bad_groq_key_fails_before_any_request() {
        let classifier = LlmClassifier::new(ChatClient::new(Provider::Groq, "sk-not-groq"));
        let err = classifier.classify(&request(&["x"])).await.unwrap_err();
        assert!(matches!(
            err,
            ClassifyError::Transport(AiError::InvalidApiKey(_))
        ));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            parse_verdicts("I cannot help with that"),
            Err(ClassifyError::Malformed(_))
        ));
    }
}
