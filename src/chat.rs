//! Structured-output chat completion providers.
//!
//! A [`ChatModel`] sends one request and returns the raw message content,
//! which the caller parses against the JSON schema it supplied. Like the
//! embedders, providers never retry on their own; callers wrap them in the
//! [`ResilientClient`](crate::resilient::ResilientClient).

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::ChatConfig;
use crate::embedding::usage_tokens;
use crate::error::{CallError, ErrorKind};
use crate::resilient::Metered;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A named JSON schema the response must conform to.
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier, also the rate-limit key.
    fn model_name(&self) -> &str;

    /// Request a completion constrained to `schema`, returning the message
    /// content and the total token usage if reported.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Metered<String>, CallError>;
}

/// Always fails; used when `chat.provider = "disabled"`.
pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _schema: &StructuredSchema,
    ) -> Result<Metered<String>, CallError> {
        Err(CallError::new(
            ErrorKind::MalformedRequest,
            "Chat provider is disabled",
        ))
    }
}

/// OpenAI `POST /chat/completions` with a strict `json_schema` response format.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    api_base: String,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], schema: &StructuredSchema) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true,
                }
            }
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: &StructuredSchema,
    ) -> Result<Metered<String>, CallError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(messages, schema))
            .send()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(CallError::from_response("OpenAI", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CallError::from_reqwest(&e))?;
        let content = message_content(&json).ok_or_else(|| {
            CallError::new(ErrorKind::Unknown, "Invalid OpenAI response: missing message content")
        })?;
        Ok(Metered::new(content, usage_tokens(&json)))
    }
}

/// `choices[0].message.content`, or the refusal text if the model refused.
fn message_content(json: &serde_json::Value) -> Option<String> {
    let message = json.get("choices")?.get(0)?.get("message")?;
    message
        .get("content")
        .and_then(|c| c.as_str())
        .or_else(|| message.get("refusal").and_then(|r| r.as_str()))
        .map(str::to_string)
}

/// Rough token estimate of a prompt for admission control.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| crate::embedding::estimate_tokens(&m.content))
        .sum()
}

pub fn create_chat_model(config: &ChatConfig) -> Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledChat)),
        "openai" => Ok(Box::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}
