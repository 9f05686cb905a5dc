//! Core data model: documents, chunks, graph primitives, and the query-facing
//! `Answer` object. Mirrors the shapes the teacher keeps in `types.rs`, widened
//! to the full entity set (documents/entities/relationships/communities) since
//! this crate persists all of them, not just chunks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type DocumentId = i64;
pub type ChunkId = i64;
pub type EntityId = i64;
pub type RelationshipId = i64;
pub type CommunityId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub path: String,
    pub filename: String,
    pub format: String,
    pub content_hash: String,
    pub parse_method: String,
    pub status: DocumentStatus,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Table,
    FormFields,
    Relationships,
}

/// A section as produced by document parsing, consumed by the chunker.
/// Sections carry the heading hierarchy the chunker must not split across.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub heading: Option<String>,
    pub content: String,
    pub level: u8,
    pub page_number: Option<u32>,
    pub chunk_type: ChunkType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub ordinal: u32,
    pub heading: Option<String>,
    pub content: String,
    pub chunk_type: ChunkType,
    pub page_number: Option<u32>,
    pub token_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Standard,
    Clause,
    Concept,
    Term,
    Regulation,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Standard => "standard",
            EntityType::Clause => "clause",
            EntityType::Concept => "concept",
            EntityType::Term => "term",
            EntityType::Regulation => "regulation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "person" => Some(EntityType::Person),
            "organization" => Some(EntityType::Organization),
            "standard" => Some(EntityType::Standard),
            "clause" => Some(EntityType::Clause),
            "concept" => Some(EntityType::Concept),
            "term" => Some(EntityType::Term),
            "regulation" => Some(EntityType::Regulation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Always lower-cased; lookup keys match this invariant.
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
    pub canonical_english_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    References,
    Defines,
    Amends,
    Requires,
    Contradicts,
    Supersedes,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::References => "references",
            RelationType::Defines => "defines",
            RelationType::Amends => "amends",
            RelationType::Requires => "requires",
            RelationType::Contradicts => "contradicts",
            RelationType::Supersedes => "supersedes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "references" => Some(RelationType::References),
            "defines" => Some(RelationType::Defines),
            "amends" => Some(RelationType::Amends),
            "requires" => Some(RelationType::Requires),
            "contradicts" => Some(RelationType::Contradicts),
            "supersedes" => Some(RelationType::Supersedes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub relation_type: RelationType,
    pub weight: f32,
    pub source_chunk_id: Option<ChunkId>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntityChunkLink {
    pub entity_id: EntityId,
    pub chunk_id: ChunkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityLevel {
    L0 = 0,
    L1 = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    pub level: CommunityLevel,
    pub entity_ids: Vec<EntityId>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogRecord {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub confidence: f32,
    pub sources_used: Vec<ChunkId>,
    pub model: String,
    pub rounds: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ---------------------------------------------------------------------
// Query-facing types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub filename: String,
    pub content: String,
    pub heading: Option<String>,
    pub page_number: Option<u32>,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningAction {
    InitialAnswer,
    Validation,
    Refinement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub round: u32,
    pub action: ReasoningAction,
    pub input: String,
    pub output: String,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub validation: Option<ValidationResult>,
    pub chunks_used: Vec<ChunkId>,
    pub tokens: u32,
    pub elapsed_ms: u64,
    pub issues: Vec<String>,
}

/// A citation-shaped substring found in an answer's final text, plus the
/// chunk it resolved to, if any. Built by `reasoner::citations_in`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedCitation {
    pub raw: String,
    pub chunk_id: Option<ChunkId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub confidence: f32,
    pub citation_issues: Vec<String>,
    pub consistency_issues: Vec<String>,
    pub completeness_issues: Vec<String>,
}

impl ValidationResult {
    pub fn ok(confidence: f32) -> Self {
        Self {
            confidence,
            citation_issues: Vec::new(),
            consistency_issues: Vec::new(),
            completeness_issues: Vec::new(),
        }
    }

    pub fn total_issues(&self) -> usize {
        self.citation_issues.len() + self.consistency_issues.len() + self.completeness_issues.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Vector,
    Fts,
    Graph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerResultTrace {
    pub chunk_id: ChunkId,
    pub methods: Vec<RetrievalMethod>,
    pub vec_rank: Option<usize>,
    pub fts_rank: Option<usize>,
    pub graph_rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTrace {
    pub vec_results: usize,
    pub fts_results: usize,
    pub graph_results: usize,
    pub fused_results: usize,
    pub vec_weight: f32,
    pub fts_weight: f32,
    pub graph_weight: f32,
    pub identifiers_detected: bool,
    pub synthesis_mode: bool,
    pub max_requested: usize,
    pub follow_up_terms: Option<Vec<String>>,
    pub follow_up_results: Option<usize>,
    pub fts_query: String,
    pub graph_entities: Vec<String>,
    pub elapsed_ms: u64,
    pub per_result: Vec<PerResultTrace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub confidence: f32,
    pub sources: Vec<Source>,
    pub reasoning: Vec<ReasoningStep>,
    pub retrieval_trace: RetrievalTrace,
    pub citations: Vec<MatchedCitation>,
    pub model_used: String,
    pub rounds: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A retrieved chunk plus the channel ranks it was found at, as produced by
/// `HybridRetriever` before the `Reasoner` turns it into a `Source`.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub document_filename: String,
    pub fused_score: f32,
    pub vec_rank: Option<usize>,
    pub fts_rank: Option<usize>,
    pub graph_rank: Option<usize>,
}
