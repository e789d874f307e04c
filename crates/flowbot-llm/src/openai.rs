use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowbot_core::config::AiConfig;
use flowbot_core::error::{FlowbotError, Result};
use flowbot_core::traits::AiGenerator;
use flowbot_core::types::{AiRequest, HistoryEntry};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default base URL for known OpenAI-compatible providers.
fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "ollama" => "http://localhost:11434/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "together" => "https://api.together.xyz/v1",
        "mistral" => "https://api.mistral.ai/v1",
        _ => OPENAI_BASE_URL,
    }
}

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiGenerator {
    http: Client,
    config: AiConfig,
    endpoint: String,
}

impl OpenAiGenerator {
    pub fn new(config: AiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowbotError::AiRequest(e.to_string()))?;
        let base = config
            .base_url
            .as_deref()
            .unwrap_or_else(|| default_base_url(&config.provider));
        let endpoint = format!("{}/chat/completions", base.trim_end_matches('/'));
        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

impl OaiMessage {
    fn new(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// Response types
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
    #[serde(default)]
    content: Option<String>,
}

fn convert_messages(system_prompt: &str, history: &[HistoryEntry], input: &str) -> Vec<OaiMessage> {
    let mut messages = vec![OaiMessage::new("system", system_prompt)];
    for entry in history {
        if !entry.user_text.is_empty() {
            messages.push(OaiMessage::new("user", entry.user_text.as_str()));
        }
        if !entry.bot_text.is_empty() {
            messages.push(OaiMessage::new("assistant", entry.bot_text.as_str()));
        }
    }
    messages.push(OaiMessage::new("user", input));
    messages
}

impl AiGenerator for OpenAiGenerator {
    fn generate(&self, request: AiRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = ChatRequest {
                model: &self.config.model_id,
                messages: convert_messages(&request.system_prompt, &request.history, &request.user_input),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                stream: false,
            };

            let mut req = self.http.post(&self.endpoint).json(&body);
            // A node-level key overrides the configured one.
            if let Some(api_key) = request.api_key.as_ref().or(self.config.api_key.as_ref()) {
                req = req.bearer_auth(api_key);
            }

            debug!(
                device = %request.device_id,
                model = %self.config.model_id,
                history = request.history.len(),
                "Sending chat completion"
            );

            let response = req
                .send()
                .await
                .map_err(|e| FlowbotError::AiRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(FlowbotError::AiRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| FlowbotError::AiParse(e.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| FlowbotError::AiParse("response has no message content".into()))
        })
    }
}
