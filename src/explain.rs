//! Natural-language explanation of a patching summary
//!
//! One chat-completion call per request against an OpenAI-compatible
//! endpoint (Groq by default). Provider failures never fail the request:
//! they come back as [`Explanation::Unavailable`] with a reason.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::summary::PatchSummary;

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-oss-20b";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const SYSTEM_PROMPT: &str = "You explain activation-patching outputs.";

/// Why an explanation could not be produced
#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("explanation provider not configured")]
    NotConfigured,

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ExplainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExplainError::Timeout
        } else {
            ExplainError::Network(e.to_string())
        }
    }
}

/// A single-turn chat completion backend
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier for logs
    fn id(&self) -> &'static str;

    async fn complete(&self, system: &str, user: &str) -> Result<String, ExplainError>;
}

/// Groq (or any OpenAI-compatible) chat completions client
pub struct GroqProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GroqProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExplainError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatProvider for GroqProvider {
    fn id(&self) -> &'static str {
        "groq"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ExplainError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ExplainError::ApiError { status, message });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExplainError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExplainError::InvalidResponse("no choices in response".into()))
    }
}

/// Settings for the explanation agent
#[derive(Debug, Clone)]
pub struct ExplainerConfig {
    /// Without a key the agent never calls out
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Outcome of an explanation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Explanation {
    Available(String),
    Unavailable(String),
}

impl Explanation {
    /// Split into the `(explanation, explanation_error)` response fields
    pub fn into_fields(self) -> (Option<String>, Option<String>) {
        match self {
            Explanation::Available(text) => (Some(text), None),
            Explanation::Unavailable(reason) => (None, Some(reason)),
        }
    }
}

/// Builds the prompt from a summary and asks the provider once
pub struct Explainer {
    provider: Option<Box<dyn ChatProvider>>,
}

impl Explainer {
    pub fn from_config(config: &ExplainerConfig) -> Result<Self, ExplainError> {
        let provider = match config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                info!(
                    "Explanations via {} ({})",
                    config.base_url, config.model
                );
                let provider = GroqProvider::new(
                    key,
                    config.base_url.as_str(),
                    config.model.as_str(),
                    Duration::from_secs(config.timeout_secs),
                )?;
                Some(Box::new(provider) as Box<dyn ChatProvider>)
            }
            None => {
                info!("No API key set, explanations disabled");
                None
            }
        };
        Ok(Self { provider })
    }

    pub fn with_provider(provider: Box<dyn ChatProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// An agent that always reports unavailable
    pub fn disabled() -> Self {
        Self { provider: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn explain(&self, summary: &PatchSummary) -> Explanation {
        let Some(provider) = &self.provider else {
            return Explanation::Unavailable(ExplainError::NotConfigured.to_string());
        };

        let prompt = match build_prompt(summary) {
            Ok(prompt) => prompt,
            Err(e) => return Explanation::Unavailable(e.to_string()),
        };

        match provider.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(text) => Explanation::Available(text),
            Err(e) => {
                warn!("Explanation via {} failed: {}", provider.id(), e);
                Explanation::Unavailable(e.to_string())
            }
        }
    }
}

/// Deterministic user prompt embedding the summary as pretty JSON
pub fn build_prompt(summary: &PatchSummary) -> Result<String, ExplainError> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| ExplainError::InvalidResponse(format!("summary serialization: {e}")))?;

    Ok(format!(
        "You are a mechanistic interpretability expert.\n\
         \n\
         Explain the following activation-patching results for subject-verb \
         agreement in clear, intuitive language. Each delta is the change in \
         the probability of the correct verb when one layer's activation from \
         the grammatical sentence is patched into the ungrammatical one.\n\
         \n\
         {json}\n\
         \n\
         Explain:\n\
         - What the delta values mean\n\
         - Which layers are most important\n\
         - What this suggests about number-agreement circuits\n\
         - What overall conclusion we can draw\n\
         \n\
         Avoid formulas. Be concise and clear.\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervention::HookPoint;
    use crate::patching::{PatchResult, PatchSite, PrefixBaseline};
    use crate::verbs::detect;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn summary() -> PatchSummary {
        let pair = detect("The cat has fur.").unwrap();
        let result = PatchResult {
            prefix: PrefixBaseline {
                p_actual: 0.2,
                p_wrong: 0.05,
                p_singular: 0.2,
                p_plural: 0.05,
            },
            clean_correct: 0.3,
            clean_incorrect: 0.1,
            layer_probs: vec![0.1, 0.2, 0.3],
            hook: HookPoint::ResidPost,
            site: PatchSite::Verb,
            verb_position: Some(2),
            patched_positions: vec![2],
            readout_position: 4,
            seq_len: 5,
            truncated: false,
        };
        PatchSummary::from_result(&pair, &result).unwrap()
    }

    fn explainer_for(server: &MockServer, timeout_secs: u64) -> Explainer {
        Explainer::from_config(&ExplainerConfig {
            api_key: Some("test-key".into()),
            base_url: server.uri(),
            timeout_secs,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let s = summary();
        let a = build_prompt(&s).unwrap();
        assert_eq!(a, build_prompt(&s).unwrap());
        assert!(a.contains("\"best_layer\": 2"));
        assert!(a.contains("\"top_layers\""));
        assert!(a.contains("Avoid formulas."));
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let explainer = Explainer::from_config(&ExplainerConfig::default()).unwrap();
        assert!(!explainer.is_enabled());
        assert_eq!(
            explainer.explain(&summary()).await,
            Explanation::Unavailable("explanation provider not configured".into())
        );
    }

    #[tokio::test]
    async fn test_explanation_returned_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({ "model": DEFAULT_LLM_MODEL })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Layer 2 matters."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let explanation = explainer_for(&server, 5).explain(&summary()).await;
        assert_eq!(explanation, Explanation::Available("Layer 2 matters.".into()));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let explanation = explainer_for(&server, 5).explain(&summary()).await;
        assert_eq!(
            explanation,
            Explanation::Unavailable("API error 500: boom".into())
        );
    }

    #[tokio::test]
    async fn test_empty_choices_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let (text, error) = explainer_for(&server, 5)
            .explain(&summary())
            .await
            .into_fields();
        assert!(text.is_none());
        assert!(error.unwrap().contains("no choices"));
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let explanation = explainer_for(&server, 1).explain(&summary()).await;
        assert_eq!(explanation, Explanation::Unavailable("request timed out".into()));
    }
}
