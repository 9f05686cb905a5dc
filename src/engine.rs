//! Façade wiring `Store`, `Chunker`, `GraphBuilder`, `CommunityEngine`,
//! `HybridRetriever`, and `Reasoner` into the public surface a thin HTTP
//! layer would expose 1:1. Grounded on `rag_engine::RAGEngine`, which plays
//! the identical role for the teacher's own component set.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::community::CommunityEngine;
use crate::config::RagConfig;
use crate::error::{EngineError, EngineResult};
use crate::graph::{GraphBuilder, GraphBuilderParams};
use crate::chunker::{Chunker, ChunkerParams};
use crate::llm::http::HttpProvider;
use crate::llm::{ChatModel, EmbeddingModel};
use crate::reasoner::{self, Reasoner, ReasonerParams};
use crate::retrieval::{HybridRetriever, RetrievalWeights, Translator};
use crate::store::Store;
use crate::types::{Answer, Chunk, ChunkId, Document, DocumentId, DocumentStatus, Section};

const EMBED_BATCH_SIZE: usize = 32;
const MAX_EMBED_CHARS: usize = 24_000;

pub struct UpdateOutcome {
    pub path: String,
    pub changed: bool,
    pub error: Option<String>,
}

pub struct Engine {
    store: Store,
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbeddingModel>,
    translator: Translator,
    chunker: Chunker,
    config: RagConfig,
}

impl Engine {
    pub async fn open(config: RagConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::ValidationError)?;

        let chat: Arc<dyn ChatModel> = Arc::new(HttpProvider::new(&config.chat).context("construct chat provider")?);
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(
            HttpProvider::with_dimension(&config.embedding, config.embedding_dim).context("construct embedding provider")?,
        );
        let translation_chat: Arc<dyn ChatModel> = Arc::new(
            HttpProvider::new(config.translation_provider()).context("construct translation provider")?,
        );

        let store = Store::open(&config.data_dir, config.embedding_dim).await.context("open store")?;
        let chunker = Chunker::new(ChunkerParams { max_tokens: config.chunking.max_chunk_tokens as u32, overlap: config.chunking.chunk_overlap as u32 })
            .map_err(EngineError::ValidationError)?;

        Ok(Self {
            store,
            chat,
            embedder,
            translator: Translator::new(Some(translation_chat)),
            chunker,
            config,
        })
    }

    pub fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    /// Ingests a document whose sections have already been parsed by a
    /// format-specific adapter (out of scope here). Identical content at the
    /// same path is a no-op unless `force` is set.
    pub async fn ingest(
        &self,
        path: &str,
        filename: &str,
        format: &str,
        content_hash: &str,
        parse_method: &str,
        sections: &[Section],
        force: bool,
    ) -> EngineResult<(DocumentId, bool)> {
        let (document_id, changed) = self
            .store
            .upsert_document(path, filename, format, content_hash, parse_method)
            .await
            .context("upsert document")?;

        if !changed && !force {
            return Ok((document_id, false));
        }

        self.store.replace_document_data(document_id).await.context("clear stale chunk data")?;

        match self.ingest_chunks(document_id, sections).await {
            Ok(()) => {
                self.store.set_document_status(document_id, DocumentStatus::Ready).await.context("mark document ready")?;
            }
            Err(e) => {
                self.store.set_document_status(document_id, DocumentStatus::Error).await.ok();
                return Err(EngineError::Internal(e));
            }
        }

        Ok((document_id, true))
    }

    async fn ingest_chunks(&self, document_id: DocumentId, sections: &[Section]) -> anyhow::Result<()> {
        let drafts = self.chunker.chunk(sections);
        let ids = self.store.allocate_chunk_ids(drafts.len());

        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(ordinal, (draft, id))| Chunk {
                id,
                document_id,
                ordinal: ordinal as u32,
                heading: draft.heading,
                content: draft.content,
                chunk_type: draft.chunk_type,
                page_number: draft.page_number,
                token_count: draft.token_count,
            })
            .collect();

        let vectors = self.embed_all(&chunks.iter().map(|c| c.content.clone()).collect::<Vec<_>>()).await;
        self.store.insert_chunks(&chunks, &vectors).await?;

        if !self.config.graph.skip_graph {
            let builder = GraphBuilder::new(&self.store, self.chat.clone(), GraphBuilderParams { concurrency: self.config.graph.graph_concurrency });
            let outcome = builder.build(&chunks, CancellationToken::new()).await.context("graph build")?;
            info!(succeeded = outcome.succeeded, failed = outcome.failed, eligible = outcome.eligible, "graph build finished");

            let community_engine = CommunityEngine::new(&self.store, self.chat.clone());
            if let Err(e) = community_engine.rebuild().await {
                warn!(error = %e, "community rebuild failed, leaving prior community set in place");
            }
        }

        Ok(())
    }

    /// Embeds in batches of 32; a batch failure falls back to per-text calls
    /// so one oversize input does not discard its peers. Inputs are
    /// truncated at the last whitespace boundary before 24,000 characters.
    async fn embed_all(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let truncated: Vec<String> = texts.iter().map(|t| truncate_for_embedding(t)).collect();
        let mut out = Vec::with_capacity(truncated.len());

        for batch in truncated.chunks(EMBED_BATCH_SIZE) {
            match self.embedder.embed(batch).await {
                Ok(vectors) => out.extend(vectors.into_iter().map(Some)),
                Err(e) => {
                    warn!(error = %e, "embedding batch failed, falling back to per-text calls");
                    for text in batch {
                        match self.embedder.embed(std::slice::from_ref(text)).await {
                            Ok(mut v) => out.push(v.pop()),
                            Err(e) => {
                                warn!(error = %e, "embedding failed for one chunk, leaving unembedded");
                                out.push(None);
                            }
                        }
                    }
                }
            }
        }

        out
    }

    /// Re-ingests the document at `path` if its current content hash
    /// differs from what was last stored. The caller supplies the freshly
    /// parsed sections (parsing itself is out of scope here).
    pub async fn update(&self, path: &str, filename: &str, format: &str, content_hash: &str, parse_method: &str, sections: &[Section]) -> EngineResult<bool> {
        let (_, changed) = self.ingest(path, filename, format, content_hash, parse_method, sections, false).await?;
        Ok(changed)
    }

    pub async fn delete_document(&self, document_id: DocumentId) -> EngineResult<()> {
        self.store.delete_document(document_id).await.context("delete document")?;
        Ok(())
    }

    pub async fn list_documents(&self) -> EngineResult<Vec<Document>> {
        Ok(self.store.list_documents().await.context("list documents")?)
    }

    pub async fn health(&self) -> EngineResult<()> {
        self.store.list_documents().await.context("store reachability check")?;
        Ok(())
    }

    pub async fn query(&self, question: &str, max_results: usize, max_rounds: u32, weights: Option<RetrievalWeights>) -> EngineResult<Answer> {
        let weights = weights.unwrap_or(RetrievalWeights {
            vector: self.config.retrieval.weight_vector,
            fts: self.config.retrieval.weight_fts,
            graph: self.config.retrieval.weight_graph,
        });

        let retriever = HybridRetriever::new(&self.store, self.embedder.clone(), &self.translator);
        let (retrieved, trace) = retriever.retrieve(question, max_results, weights).await.map_err(EngineError::Internal)?;

        if retrieved.is_empty() {
            return Err(EngineError::NoResults);
        }

        let requested_rounds = if max_rounds == 0 { self.config.reasoning.max_rounds } else { max_rounds.clamp(1, 3) };
        let reasoner = Reasoner::new(
            self.chat.clone(),
            ReasonerParams { max_rounds: requested_rounds, confidence_threshold: self.config.reasoning.confidence_threshold },
        );

        let mut answer = reasoner.reason(question, &retrieved, trace).await.map_err(EngineError::Internal)?;

        if answer.retrieval_trace.synthesis_mode && answer.retrieval_trace.fused_results >= answer.retrieval_trace.max_requested {
            let missing = reasoner::missing_identifiers(&answer.text, &retrieved);
            if !missing.is_empty() {
                if let Ok(followup) = self.synthesis_followup(question, &missing, &retrieved, &reasoner).await {
                    answer = Answer {
                        text: followup.text,
                        confidence: followup.confidence,
                        sources: followup.sources,
                        reasoning: followup.reasoning,
                        retrieval_trace: followup.retrieval_trace,
                        citations: followup.citations,
                        model_used: followup.model_used,
                        rounds: answer.rounds + followup.rounds,
                        prompt_tokens: answer.prompt_tokens + followup.prompt_tokens,
                        completion_tokens: answer.completion_tokens + followup.completion_tokens,
                        total_tokens: answer.total_tokens + followup.total_tokens,
                    };
                }
            }
        }

        let sources_used: Vec<ChunkId> = answer.sources.iter().map(|s| s.chunk_id).collect();
        self.store
            .log_query(question, &answer.text, answer.confidence, &sources_used, &answer.model_used, answer.rounds, answer.prompt_tokens, answer.completion_tokens)
            .await
            .context("log query")?;

        Ok(answer)
    }

    async fn synthesis_followup(
        &self,
        question: &str,
        missing: &[String],
        original: &[crate::types::RetrievedChunk],
        reasoner: &Reasoner,
    ) -> anyhow::Result<Answer> {
        let fts_query = missing.iter().map(|m| format!("\"{}\"", m.replace('-', " "))).collect::<Vec<_>>().join(" OR ");
        let weights = RetrievalWeights { vector: 0.5, fts: 2.0, graph: 1.0 };

        let retriever = HybridRetriever::new(&self.store, self.embedder.clone(), &self.translator);
        let (follow_results, mut follow_trace) = retriever.retrieve(&fts_query, 15, weights).await?;

        let mut merged = original.to_vec();
        let mut seen: std::collections::HashSet<ChunkId> = merged.iter().map(|r| r.chunk.id).collect();
        for r in follow_results {
            if seen.insert(r.chunk.id) {
                merged.push(r);
            }
        }

        follow_trace.follow_up_terms = Some(missing.to_vec());
        follow_trace.follow_up_results = Some(merged.len());

        let answer = reasoner.reason(question, &merged, follow_trace).await?;
        Ok(answer)
    }
}

fn truncate_for_embedding(text: &str) -> String {
    if text.len() <= MAX_EMBED_CHARS {
        return text.to_string();
    }
    let cut = text[..MAX_EMBED_CHARS].rfind(char::is_whitespace).unwrap_or(MAX_EMBED_CHARS);
    text[..cut].to_string()
}
