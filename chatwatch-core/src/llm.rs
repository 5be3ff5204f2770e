use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{MonitorError, Result};
use crate::model::SeverityLevel;

const SYSTEM_PROMPT: &str = "You are an assistant that prioritizes production alerts.";

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Authentication failed")]
    AuthenticationError,
    #[error("Rate limited")]
    RateLimited,
}

/// Opaque text-in, text-out model used for tie-break classification and digest summaries.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, prompt: &str) -> std::result::Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Client for any endpoint speaking the chat-completions protocol.
pub struct OpenAiCompatibleClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| MonitorError::configuration("LLM endpoint is required when enabled"))?;
        let model = config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| MonitorError::configuration("LLM model is required when enabled"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            model,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            max_tokens: config.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn invoke(&self, prompt: &str) -> std::result::Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: self.max_tokens,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(model = %self.model, "Invoking LLM");
        let response = builder.send().await?;

        if response.status() == 401 {
            return Err(LlmError::AuthenticationError);
        }

        if response.status() == 429 {
            return Err(LlmError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::InvalidResponse(format!("HTTP {}: {}", status, error_text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))
    }
}

/// Prompt asking the model to re-rate an alert that sits exactly on the notify threshold.
pub fn render_triage_prompt(message_text: &str, channel_label: &str, recurrence_count: u32) -> String {
    format!(
        "Quickly assess the alert below and reply with ONLY one word: CRITICAL, IMPORTANT, NORMAL or IGNORE.\n\n\
         Channel: {}\n\
         Recent occurrences: {}\n\
         Message: {}\n",
        channel_label, recurrence_count, message_text
    )
}

/// Accepts a reply only if it is exactly one severity name.
pub fn parse_severity_reply(reply: &str) -> Option<SeverityLevel> {
    let cleaned = reply.trim().trim_matches(|c: char| c == '.' || c == '"' || c == '`');
    match cleaned.to_uppercase().as_str() {
        "CRITICAL" | "IMPORTANT" | "NORMAL" | "IGNORE" => cleaned.parse().ok(),
        _ => None,
    }
}
