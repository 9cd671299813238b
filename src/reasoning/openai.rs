//! OpenAI-compatible `/chat/completions` adapter.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Reasoner, ReasonerError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

/// Missing credentials for the reasoning endpoint.
#[derive(Debug, Error)]
#[error("missing reasoning environment variable `{var}`")]
pub struct OpenAiConfigError {
    /// Name of the variable.
    pub var: &'static str,
}

/// Endpoint, credentials and model of the reasoning service.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API root, without the trailing `/chat/completions`.
    pub base_url: String,
    /// Secret sent as a bearer token.
    pub api_key: String,
    /// Model name.
    pub model: String,
    /// Upper bound on one completion request.
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    /// Read `OPENAI_API_KEY` (required), `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self, OpenAiConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(OpenAiConfigError {
                var: "OPENAI_API_KEY",
            })?;

        Ok(Self {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned()),
            api_key,
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_owned()),
            request_timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// [`Reasoner`] talking to an OpenAI-compatible chat endpoint.
#[derive(Clone)]
pub struct OpenAiReasoner {
    client: Client,
    config: Arc<OpenAiConfig>,
}

impl OpenAiReasoner {
    /// Build the adapter over a pooled HTTP client.
    pub fn new(config: OpenAiConfig) -> Result<Self, ReasonerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ReasonerError::Transport { source })?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    async fn chat(&self, prompt: String, context: String) -> Result<String, ReasonerError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            temperature: 0.0,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &context,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| ReasonerError::Transport { source })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ReasonerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let decoded: ChatResponse = response
            .json()
            .await
            .map_err(|source| ReasonerError::Decode { source })?;
        let content = decoded
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ReasonerError::EmptyCompletion)?;

        debug!(model = %self.config.model, chars = content.len(), "completion received");
        Ok(content)
    }
}

impl Reasoner for OpenAiReasoner {
    fn complete(
        &self,
        prompt: String,
        context: String,
    ) -> BoxFuture<'static, Result<String, ReasonerError>> {
        let reasoner = self.clone();
        Box::pin(async move { reasoner.chat(prompt, context).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_puts_context_before_prompt() {
        let body = ChatRequest {
            model: "m",
            temperature: 0.0,
            messages: [
                ChatMessage {
                    role: "system",
                    content: "judge fairly",
                },
                ChatMessage {
                    role: "user",
                    content: "entries",
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["messages"][0]["role"], "system");
        assert_eq!(encoded["messages"][1]["content"], "entries");
        assert_eq!(encoded["response_format"]["type"], "json_object");
    }

    #[test]
    fn response_without_choices_decodes_empty() {
        let decoded: ChatResponse = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(decoded.choices.is_empty());

        let decoded: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"reply_id\":\"1\"}"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            decoded.choices[0].message.content.as_deref(),
            Some(r#"{"reply_id":"1"}"#)
        );
    }
}
