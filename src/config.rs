use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration. Generalized from the teacher's flat
/// `RAGConfig` into the full surface the engine's components need: provider
/// configs for chat/embedding/vision/translation, retrieval weights, chunk
/// sizing, graph concurrency, and the reasoner's round/confidence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub db_name: String,
    pub chat: ProviderConfig,
    pub embedding: ProviderConfig,
    pub vision: Option<ProviderConfig>,
    /// Defaults to `chat` when absent (see `translation_provider`).
    pub translation: Option<ProviderConfig>,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
    pub graph: GraphConfig,
    pub reasoning: ReasoningConfig,
    pub embedding_dim: usize,
    pub caption_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl ProviderConfig {
    fn ollama(model: &str) -> Self {
        Self {
            provider: "ollama".into(),
            model: model.into(),
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub weight_vector: f32,
    pub weight_fts: f32,
    pub weight_graph: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_chunk_tokens: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub skip_graph: bool,
    pub graph_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub max_rounds: u32,
    pub confidence_threshold: f32,
}

impl RagConfig {
    pub fn translation_provider(&self) -> &ProviderConfig {
        self.translation.as_ref().unwrap_or(&self.chat)
    }

    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding_dim == 0 {
            return Err("embedding_dim must be > 0".into());
        }
        if self.chunking.max_chunk_tokens < 1 {
            return Err("chunking.max_chunk_tokens must be >= 1".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.max_chunk_tokens {
            return Err("chunking.chunk_overlap must be < max_chunk_tokens".into());
        }
        if self.graph.graph_concurrency == 0 {
            return Err("graph.graph_concurrency must be > 0".into());
        }
        if !(1..=3).contains(&self.reasoning.max_rounds) {
            return Err("reasoning.max_rounds must be in 1..=3".into());
        }
        if !(0.0..=1.0).contains(&self.reasoning.confidence_threshold) {
            return Err("reasoning.confidence_threshold must be in [0.0, 1.0]".into());
        }
        for (name, w) in [
            ("weight_vector", self.retrieval.weight_vector),
            ("weight_fts", self.retrieval.weight_fts),
            ("weight_graph", self.retrieval.weight_graph),
        ] {
            if w < 0.0 {
                return Err(format!("retrieval.{name} must be >= 0.0"));
            }
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("goreason");

        Self {
            data_dir,
            db_name: "goreason".into(),
            chat: ProviderConfig::ollama("llama3.1:8b"),
            embedding: ProviderConfig::ollama("nomic-embed-text"),
            vision: None,
            translation: None,
            retrieval: RetrievalConfig {
                weight_vector: 1.0,
                weight_fts: 1.0,
                weight_graph: 0.5,
            },
            chunking: ChunkingConfig {
                max_chunk_tokens: 1024,
                chunk_overlap: 128,
            },
            graph: GraphConfig {
                skip_graph: false,
                graph_concurrency: 16,
            },
            reasoning: ReasoningConfig {
                max_rounds: 3,
                confidence_threshold: 0.7,
            },
            embedding_dim: 768,
            caption_images: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_overlap_ge_max_tokens() {
        let mut cfg = RagConfig::default();
        cfg.chunking.chunk_overlap = cfg.chunking.max_chunk_tokens;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn translation_defaults_to_chat() {
        let cfg = RagConfig::default();
        assert_eq!(cfg.translation_provider().model, cfg.chat.model);
    }
}
