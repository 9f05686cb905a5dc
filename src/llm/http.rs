//! HTTP-backed chat/embedding provider: one reference adapter speaking the
//! OpenAI-compatible chat/embeddings wire format, since per-provider clients
//! are out of scope. Retry/backoff is generalized from
//! `ExternalProvider::openai_compatible_generate` (no retry there) up to this
//! crate's exact policy: 120s request timeout, up to 6 retries with
//! exponential backoff (2s, 4s, 8s, …) on {429, 502, 503, 504} and network
//! errors, 429 honoring `Retry-After` with a 5s×2^attempt backoff floor.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{ChatModel, ChatRequest, ChatResponse, ChatRole, EmbeddingModel};
use crate::config::ProviderConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 6;
const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];
/// Max characters sent per embedding input; truncated at the last whitespace
/// boundary before the limit.
const MAX_EMBED_CHARS: usize = 24_000;

pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    embedding_dim: usize,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Self::with_dimension(config, 0)
    }

    /// `embedding_dim` is only meaningful when this provider is used as an
    /// `EmbeddingModel`; chat-only providers can pass 0.
    pub fn with_dimension(config: &ProviderConfig, embedding_dim: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("failed to build HTTP client")?;

        let base_url = config.base_url.clone().unwrap_or_else(|| match config.provider.as_str() {
            "ollama" => "http://localhost:11434/v1".to_string(),
            "openai" => "https://api.openai.com/v1".to_string(),
            other => format!("http://localhost:11434/v1/{other}"),
        });

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_dim,
        })
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn embeddings_endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }

    /// Send `body` to `endpoint`, retrying on retryable statuses and network
    /// errors, and return the parsed JSON body on success.
    async fn post_with_retry(&self, endpoint: &str, body: Value) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            let mut req = self.client.post(endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {key}"));
            }

            let send_result = req.send().await;

            let response = match send_result {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= MAX_RETRIES || !(e.is_timeout() || e.is_connect()) {
                        return Err(anyhow!("request to {endpoint} failed: {e}"));
                    }
                    tokio::time::sleep(backoff_delay(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return parse_json_body(response, endpoint).await;
            }

            let retryable = RETRYABLE_STATUSES.contains(&status.as_u16());
            if !retryable || attempt >= MAX_RETRIES {
                let body_text = response.text().await.unwrap_or_default();
                return Err(anyhow!(
                    "request to {endpoint} failed with status {status}: {body_text}"
                ));
            }

            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
            } else {
                None
            };

            tokio::time::sleep(backoff_delay(attempt, retry_after.map(|_| status))).await;
            attempt += 1;
        }
    }
}

/// Exponential backoff in seconds: 2, 4, 8, … for general retries. For 429
/// responses the floor is 5s×2^attempt instead, regardless of `Retry-After`
/// (the header, when present, is honored by the caller choosing the larger
/// of the two — here we just compute the floor).
fn backoff_delay(attempt: u32, status_429: Option<StatusCode>) -> Duration {
    if status_429.is_some() {
        Duration::from_secs(5 * 2u64.pow(attempt))
    } else {
        Duration::from_secs(2u64.pow(attempt + 1))
    }
}

async fn parse_json_body(response: reqwest::Response, endpoint: &str) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("failed to read response body from {endpoint}: {e}"))?;
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(anyhow!(
            "endpoint {endpoint} returned HTML instead of JSON (HTTP {status}) — service may be down. Response: {preview}"
        ));
    }
    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        anyhow!("failed to parse JSON from {endpoint} (HTTP {status}): {e}. Body: {preview}")
    })
}

fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let slice = &text[..MAX_EMBED_CHARS];
    match slice.rfind(char::is_whitespace) {
        Some(idx) => &slice[..idx],
        None => slice,
    }
}

#[async_trait]
impl ChatModel for HttpProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": req.temperature,
            "stream": false,
        });
        if req.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let value = self.post_with_retry(&self.chat_endpoint(), body).await?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("chat response missing choices[0].message.content: {value}"))?
            .to_string();
        let prompt_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(ChatResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingModel for HttpProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(|t| truncate_for_embedding(t)).collect();
        let body = json!({
            "model": self.model,
            "input": inputs,
        });

        let value = self.post_with_retry(&self.embeddings_endpoint(), body).await?;
        let data = value["data"]
            .as_array()
            .ok_or_else(|| anyhow!("embeddings response missing data array: {value}"))?;

        data.iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .ok_or_else(|| anyhow!("embedding item missing 'embedding' array"))
                    .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_delay(0, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(1, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(8));
    }

    #[test]
    fn rate_limit_backoff_uses_higher_floor() {
        assert_eq!(backoff_delay(0, Some(StatusCode::TOO_MANY_REQUESTS)), Duration::from_secs(5));
        assert_eq!(backoff_delay(1, Some(StatusCode::TOO_MANY_REQUESTS)), Duration::from_secs(10));
    }

    #[test]
    fn truncates_at_whitespace_boundary() {
        let long = "word ".repeat(10_000);
        let truncated = truncate_for_embedding(&long);
        assert!(truncated.len() <= MAX_EMBED_CHARS);
        assert!(!truncated.ends_with(' ') || truncated.is_empty());
    }

    #[test]
    fn short_text_is_unchanged() {
        assert_eq!(truncate_for_embedding("hello"), "hello");
    }
}
