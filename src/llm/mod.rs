//! Capability interface for chat/embedding providers.
//!
//! Modeled as a capability interface (`chat`, `embed`, optional
//! `chat_with_images`) rather than one god-trait per concrete provider;
//! concrete providers are selected by a tagged variant of configuration
//! (`config::ProviderConfig::provider`). Vision capability is optional and
//! discovered via a separate handle (`ChatModel::vision`) rather than baked
//! into every implementor.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;

pub use http::HttpProvider;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(system: &str, user: &str, temperature: f32) -> Self {
        Self {
            messages: vec![
                ChatMessage {
                    role: ChatRole::System,
                    content: system.to_string(),
                },
                ChatMessage {
                    role: ChatRole::User,
                    content: user.to_string(),
                },
            ],
            temperature,
            json_mode: false,
            max_tokens: None,
        }
    }

    pub fn json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A chat-capable backend. One request in flight per client is acceptable;
/// higher internal parallelism is permitted but not required.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Chat with image attachments, for providers with vision support.
    /// Returns `Ok(None)` when the capability isn't available rather than an
    /// error, so callers can treat it as "not discovered" instead of a
    /// transport failure.
    async fn chat_with_images(&self, _req: &ChatRequest, _images: &[Vec<u8>]) -> Result<Option<ChatResponse>> {
        Ok(None)
    }

    fn model_name(&self) -> &str;
}

/// An embedding-capable backend.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}
