//! Sole owner of persistent state: documents, chunks/vectors, full-text
//! index, entities/relationships/links, communities, query log — one
//! `data_dir`, several Lance tables plus one Tantivy index, exactly as the
//! teacher roots `LanceStore` and `TextSearch` under one directory. No
//! component outside `Store` touches the underlying tables directly.

mod communities;
mod documents;
mod graph;
mod query_log;
mod text_index;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::types::{
    Chunk, ChunkId, CommunityLevel, Document, DocumentId, DocumentStatus, Entity, EntityId, EntityType,
    RelationType, Relationship, RelationshipId,
};

pub use documents::ChunkHit;

/// Bumped whenever a table's column set changes in a way older binaries
/// can't read. We do not ship a migration runner (out of scope); this is
/// only the refuse-to-open gate.
const SCHEMA_VERSION: u32 = 1;

pub struct Store {
    data_dir: PathBuf,
    documents: documents::DocumentTable,
    chunks: documents::ChunkTable,
    text_index: text_index::TextIndex,
    graph: graph::GraphStore,
    communities: communities::CommunityStore,
    query_log: query_log::QueryLogStore,
    dimension: usize,
}

impl Store {
    pub async fn open(data_dir: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(data_dir).context("create data_dir")?;
        check_schema_version(data_dir)?;

        let db = lancedb::connect(data_dir.to_str().context("data_dir is not valid UTF-8")?)
            .execute()
            .await
            .context("failed to connect to LanceDB")?;

        let documents = documents::DocumentTable::open(db.clone()).await?;
        let chunks = documents::ChunkTable::open(db.clone(), dimension).await?;
        let graph = graph::GraphStore::open(db.clone()).await?;
        let communities = communities::CommunityStore::open(db.clone()).await?;
        let query_log = query_log::QueryLogStore::open(db).await?;
        let text_index = text_index::TextIndex::open(data_dir)?;

        write_schema_version(data_dir)?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            documents,
            chunks,
            text_index,
            graph,
            communities,
            query_log,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    // -- documents --------------------------------------------------------

    /// Keyed by path; returns the same id when the hash is unchanged
    /// (re-ingest no-op).
    pub async fn upsert_document(&self, path: &str, filename: &str, format: &str, content_hash: &str, parse_method: &str) -> Result<(DocumentId, bool)> {
        self.documents.upsert(path, filename, format, content_hash, parse_method).await
    }

    pub async fn set_document_status(&self, id: DocumentId, status: DocumentStatus) -> Result<()> {
        self.documents.set_status(id, status).await
    }

    pub async fn get_document_by_path(&self, path: &str) -> Result<Option<Document>> {
        self.documents.find_by_path(path).await
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.documents.list().await
    }

    /// Atomically deletes chunks/embeddings/FTS/entity-links/relationships
    /// attributable to this document. Entities themselves are left in place
    /// since they may still be referenced by other documents' chunks.
    pub async fn replace_document_data(&self, document_id: DocumentId) -> Result<()> {
        let deleted_ids = self.chunks.delete_by_document(document_id).await?;
        self.text_index.delete_ids(&deleted_ids)?;
        self.graph.delete_by_chunk_ids(&deleted_ids).await?;
        Ok(())
    }

    pub async fn delete_document(&self, document_id: DocumentId) -> Result<()> {
        self.replace_document_data(document_id).await?;
        self.documents.delete(document_id).await
    }

    // -- chunks / vectors ---------------------------------------------------

    pub fn allocate_chunk_ids(&self, n: usize) -> Vec<ChunkId> {
        self.chunks.allocate_ids(n)
    }

    /// Inserts chunks in the same order as `chunks` (chunk ids must already
    /// equal chunker output order — see `allocate_chunk_ids`), along with
    /// their FTS entries, so no chunk is ever left without one.
    pub async fn insert_chunks(&self, chunks: &[Chunk], vectors: &[Option<Vec<f32>>]) -> Result<()> {
        self.chunks.insert(chunks, vectors).await?;
        let fts_rows: Vec<(ChunkId, &str, &str)> = chunks
            .iter()
            .map(|c| (c.id, c.content.as_str(), c.heading.as_deref().unwrap_or("")))
            .collect();
        self.text_index.index_chunks(&fts_rows)?;
        self.text_index.commit()?;
        Ok(())
    }

    pub async fn insert_embedding(&self, chunk_id: ChunkId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            bail!("embedding dimension mismatch: expected {}, got {}", self.dimension, vector.len());
        }
        self.chunks.set_vector(chunk_id, vector).await
    }

    pub async fn vector_top_k(&self, vector: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        if vector.len() != self.dimension {
            bail!("query embedding dimension mismatch: expected {}, got {}", self.dimension, vector.len());
        }
        Ok(self.chunks.vector_top_k(vector, k).await?.into_iter().map(|h| (h.chunk.id, h.score)).collect())
    }

    pub fn fts_top_k(&self, query: &str, k: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.text_index.search(query, k)
    }

    pub async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        Ok(self.chunks.by_ids(ids).await?.into_iter().map(|h| h.chunk).collect())
    }

    pub async fn chunks_for_document(&self, document_id: DocumentId) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks
            .by_predicate(&format!("document_id = {document_id}"), usize::MAX)
            .await?
            .into_iter()
            .map(|h| h.chunk)
            .collect())
    }

    /// Random-ish sample used by the translator to seed corpus-language
    /// detection; "random" is not load-bearing here so the first `n` rows by
    /// insertion order is an acceptable substitute for a true sample.
    pub async fn sample_chunks(&self, n: usize) -> Result<Vec<Chunk>> {
        Ok(self.chunks.by_predicate("id > 0", n).await?.into_iter().map(|h| h.chunk).collect())
    }

    pub async fn corpus_languages(&self) -> Result<Vec<String>> {
        let sample = self.sample_chunks(50).await?;
        Ok(detect_languages(&sample))
    }

    // -- graph --------------------------------------------------------------

    pub async fn upsert_entity_and_link(&self, name: &str, entity_type: EntityType, description: &str, chunk_id: ChunkId) -> Result<EntityId> {
        self.graph.upsert_entity_and_link(name, entity_type, description, chunk_id).await
    }

    pub async fn insert_relationship(&self, source_entity_id: EntityId, target_entity_id: EntityId, relation_type: RelationType, weight: f32, source_chunk_id: Option<ChunkId>, description: &str) -> Result<RelationshipId> {
        self.graph.insert_relationship(source_entity_id, target_entity_id, relation_type, weight, source_chunk_id, description).await
    }

    pub async fn entities_by_names(&self, names: &[String]) -> Result<Vec<Entity>> {
        self.graph.entities_by_names(names).await
    }

    pub async fn entities_by_substring(&self, terms: &[String]) -> Result<Vec<Entity>> {
        self.graph.entities_by_substring(terms).await
    }

    pub async fn entities_by_english_name(&self, terms: &[String]) -> Result<Vec<Entity>> {
        self.graph.entities_by_english_name(terms).await
    }

    pub async fn related_entities(&self, seed_ids: &[EntityId], limit: usize) -> Result<Vec<Entity>> {
        self.graph.related_entities(seed_ids, limit).await
    }

    pub async fn graph_top_k(&self, entity_ids: &[EntityId], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.graph.graph_top_k(entity_ids, k).await
    }

    pub async fn all_entities(&self) -> Result<Vec<Entity>> {
        self.graph.all_entities().await
    }

    pub async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        self.graph.all_relationships().await
    }

    // -- communities ----------------------------------------------------

    /// Fully replaces the community set. `CommunityEngine` computes the
    /// complete level-0/level-1 set in memory before calling this once, so
    /// the clear+insert the contract describes happens as one call here
    /// rather than two public entry points a caller could interleave reads
    /// between.
    pub async fn replace_communities(&self, communities: &[(CommunityLevel, Vec<EntityId>, Option<String>)]) -> Result<()> {
        self.communities.replace_all(communities).await
    }

    pub async fn get_communities(&self, level: CommunityLevel) -> Result<Vec<crate::types::Community>> {
        self.communities.get(level).await
    }

    // -- query log ------------------------------------------------------

    pub async fn log_query(&self, question: &str, answer: &str, confidence: f32, sources_used: &[ChunkId], model: &str, rounds: u32, prompt_tokens: u32, completion_tokens: u32) -> Result<i64> {
        self.query_log.append(question, answer, confidence, sources_used, model, rounds, prompt_tokens, completion_tokens).await
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn check_schema_version(data_dir: &Path) -> Result<()> {
    let path = data_dir.join("schema_version.json");
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(&path).context("read schema_version.json")?;
    let on_disk: u32 = serde_json::from_str::<serde_json::Value>(&content)
        .ok()
        .and_then(|v| v.get("version").and_then(|v| v.as_u64()))
        .unwrap_or(0) as u32;
    if on_disk > SCHEMA_VERSION {
        bail!(
            "database at {:?} was written by a newer schema version ({} > {}); refusing to open",
            data_dir,
            on_disk,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

fn write_schema_version(data_dir: &Path) -> Result<()> {
    let path = data_dir.join("schema_version.json");
    let body = serde_json::json!({ "version": SCHEMA_VERSION });
    std::fs::write(path, serde_json::to_string_pretty(&body)?).context("write schema_version.json")
}

/// Coarse language detection from a chunk sample: ASCII-heavy chunks are
/// "english"; chunks whose non-ASCII-letter ratio crosses a threshold are
/// bucketed by Unicode script name. Good enough to drive the translator's
/// "is there a non-English language in this corpus" decision without a real
/// language-ID model (out of scope).
fn detect_languages(chunks: &[Chunk]) -> Vec<String> {
    use std::collections::HashSet;
    let mut found = HashSet::new();
    for chunk in chunks {
        let non_ascii = chunk.content.chars().filter(|c| !c.is_ascii()).count();
        let total = chunk.content.chars().count().max(1);
        if (non_ascii as f32 / total as f32) > 0.15 {
            found.insert(script_name(&chunk.content));
        } else {
            found.insert("english".to_string());
        }
    }
    found.into_iter().collect()
}

fn script_name(text: &str) -> String {
    for c in text.chars() {
        if ('\u{4E00}'..='\u{9FFF}').contains(&c) {
            return "chinese".to_string();
        }
        if ('\u{3040}'..='\u{30FF}').contains(&c) {
            return "japanese".to_string();
        }
        if ('\u{0600}'..='\u{06FF}').contains(&c) {
            return "arabic".to_string();
        }
        if ('\u{0400}'..='\u{04FF}').contains(&c) {
            return "russian".to_string();
        }
        if ('\u{00C0}'..='\u{024F}').contains(&c) {
            return "spanish".to_string();
        }
    }
    "unknown".to_string()
}
