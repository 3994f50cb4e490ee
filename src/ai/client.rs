use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AiServiceConfig;
use crate::error::{AppError, Result};

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>\s*").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            temperature: 0.3,
        }
    }
}

/// An OpenAI-compatible chat completion endpoint.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn chat(&self, messages: Vec<ChatMessage>, options: ChatOptions) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct ChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// `None` when the section lacks a base URL, key or model.
    pub fn from_config(config: &AiServiceConfig) -> Result<Option<Self>> {
        match config.credentials() {
            Some((base_url, api_key, model)) => Ok(Some(Self::new(
                base_url,
                api_key,
                model,
                Duration::from_secs(config.timeout_secs),
            )?)),
            None => Ok(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatCompletion for ChatClient {
    async fn chat(&self, messages: Vec<ChatMessage>, options: ChatOptions) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            return Err(AppError::ai_api(format!("{}: {}", status.as_u16(), error_text)));
        }

        let completion: CompletionResponse = response.json().await?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(strip_think_blocks(&message))
    }
}

/// Drops `<think>…</think>` reasoning blocks some models prepend to answers.
pub fn strip_think_blocks(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_is_removed() {
        assert_eq!(
            strip_think_blocks("<think>\nthe user wants ids\n</think>\n[1, 2]"),
            "[1, 2]"
        );
        assert_eq!(strip_think_blocks("  [3] "), "[3]");
    }

    #[test]
    fn request_serializes_openai_shape() {
        let request = CompletionRequest {
            model: "m",
            messages: vec![ChatMessage::system("s"), ChatMessage::user("u")],
            max_tokens: 300,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "u");
        assert_eq!(json["max_tokens"], 300);
    }

    #[test]
    fn incomplete_credentials_yield_no_client() {
        let config = AiServiceConfig {
            api_key: Some("k".into()),
            ..Default::default()
        };
        assert!(ChatClient::from_config(&config).unwrap().is_none());
    }
}
