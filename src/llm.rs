//! Chat-completion client for the relation planner and classifier.
//!
//! Every caller wraps the reply in a "parse JSON or fall back to a
//! deterministic default" contract; a malformed model reply must never fail a
//! request.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Parameters for one chat call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Seam between the planner/finder and the concrete provider so tests can
/// substitute a scripted client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Returns the assistant message content.
    async fn chat(&self, req: ChatRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub content: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    /// Reads `OPENAI_API_KEY` (required), `OPENAI_MODEL`, `OPENAI_BASE_URL`.
    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENAI_API_KEY empty"));
        }

        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Single JSON-mode chat completion.
    pub async fn chat_completion(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f64,
        timeout: Duration,
    ) -> Result<LlmCallOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .context("chat completion request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("chat completion {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("chat completion json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let out = LlmCallOutput {
            model: self.model.clone(),
            content,
            usage: LlmUsage {
                prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
                completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
                total_tokens: parsed.usage.as_ref().and_then(|u| u.total_tokens),
            },
            latency_ms: start.elapsed().as_millis() as u64,
        };

        debug!(
            model = %out.model,
            latency_ms = out.latency_ms,
            total_tokens = ?out.usage.total_tokens,
            "chat completion finished"
        );

        Ok(out)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn chat(&self, req: ChatRequest) -> Result<String> {
        let out = self
            .chat_completion(
                &req.system,
                &req.user,
                req.max_tokens,
                req.temperature,
                Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            )
            .await?;
        Ok(out.content)
    }
}

/// Extracts a JSON value from a model reply, tolerating fenced code blocks.
pub fn parse_json_reply(raw: &str) -> Result<serde_json::Value> {
    let trimmed = raw.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```") {
        // ```json\n{...}\n``` or ```\n{...}\n```
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim_start_matches(['\r', '\n'])
            .trim_end_matches('`')
            .trim()
    } else {
        trimmed
    };

    serde_json::from_str(inner).context("model reply is not valid JSON")
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_json() {
        let v = parse_json_reply("{\"keywords\": [\"fed\", \"rates\"]}").unwrap();
        assert_eq!(v["keywords"][0], "fed");
    }

    #[test]
    fn parse_fenced_json() {
        let raw = "```json\n{\"slugs\": [\"fed-decision\"]}\n```";
        let v = parse_json_reply(raw).unwrap();
        assert_eq!(v["slugs"][0], "fed-decision");
    }

    #[test]
    fn parse_fenced_json_without_language() {
        let raw = "```\n{\"ok\": true}\n```";
        let v = parse_json_reply(raw).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_json_reply("not json at all").is_err());
    }
}
