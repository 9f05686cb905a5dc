//! Three-channel hybrid retriever: vector, full-text, and graph search fused
//! with Reciprocal Rank Fusion. Supersedes `search::hybrid`'s `score_aware_rrf`
//! (which blends normalized similarity back into the rank score) with the
//! plain-RRF contract `weight / (60 + rank + 1)` and adds query-adaptive
//! weighting, cross-language expansion, and a structured trace this repo's
//! data model requires.

mod decomposer;
mod translator;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::identifiers;
use crate::llm::EmbeddingModel;
use crate::store::Store;
use crate::types::{Chunk, ChunkId, PerResultTrace, RetrievalMethod, RetrievalTrace, RetrievedChunk};

use self::decomposer::{decompose_query, merge_round_robin};
pub use translator::Translator;

const RRF_K: f32 = 60.0;
const SYNTHESIS_MIN_RESULTS: usize = 40;
const GRAPH_NEIGHBOR_CAP: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub vector: f32,
    pub fts: f32,
    pub graph: f32,
}

const EXHAUSTIVE_PHRASES: &[&str] = &["all the", "every ", "complete list", "list all", "enumerate", "full list"];
const INTERROGATIVE_KEYWORDS: &[&str] = &["what", "how", "why", "when", "where", "which", "who", "list", "describe", "explain"];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "at", "for", "with", "by", "about", "as", "it", "its", "this", "that", "these", "those", "from", "into",
];

static OPERATOR_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"["*()+\-^:?\[\]{}!.,;]"#).unwrap());
static QUOTED_TERM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());
static CAPITALIZED_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z][a-zA-Z]*(?:\s+[A-Z][a-zA-Z]*)*)\b").unwrap());
static SECTION_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)+\b").unwrap());

pub struct HybridRetriever<'a> {
    store: &'a Store,
    embedder: Arc<dyn EmbeddingModel>,
    translator: &'a Translator,
}

impl<'a> HybridRetriever<'a> {
    /// `translator` is borrowed rather than owned so its cache persists across
    /// every query the engine serves, not just one retrieval call.
    pub fn new(store: &'a Store, embedder: Arc<dyn EmbeddingModel>, translator: &'a Translator) -> Self {
        Self { store, embedder, translator }
    }

    pub async fn retrieve(&self, question: &str, max_results: usize, weights: RetrievalWeights) -> Result<(Vec<RetrievedChunk>, RetrievalTrace)> {
        let started = Instant::now();

        let identifiers_detected = identifiers::contains_identifier(question);
        let synthesis_mode = is_synthesis_query(question);

        let mut effective = weights;
        if identifiers_detected {
            effective.fts *= 2.0;
            effective.vector *= 0.5;
        }
        let effective_max = if synthesis_mode { max_results.max(SYNTHESIS_MIN_RESULTS) } else { max_results };

        let languages = self.store.corpus_languages().await.unwrap_or_default();
        let non_english: Vec<String> = languages.into_iter().filter(|l| !l.eq_ignore_ascii_case("english")).collect();

        let decomposed = decompose_query(question);

        let mut vec_total = 0usize;
        let mut fts_total = 0usize;
        let mut graph_total = 0usize;
        let mut fts_queries = Vec::with_capacity(decomposed.sub_queries.len());
        let mut graph_entities: Vec<String> = Vec::new();
        let mut sub_results: Vec<Vec<FusedEntry>> = Vec::with_capacity(decomposed.sub_queries.len());

        if decomposed.sub_queries.len() == 1 {
            let sub_query = &decomposed.sub_queries[0];
            let expanded_terms = self.expand_terms(sub_query, &non_english).await;
            let fts_query = build_fts_query(sub_query, &expanded_terms);

            let (vec_hits, fts_hits, graph_hits, entities) =
                self.channel_results(sub_query, &expanded_terms, &fts_query, effective_max, synthesis_mode).await?;
            vec_total += vec_hits.len();
            fts_total += fts_hits.len();
            graph_total += graph_hits.len();
            graph_entities.extend(entities);
            fts_queries.push(fts_query);
            sub_results.push(fuse(&vec_hits, &fts_hits, &graph_hits, effective));
        } else {
            for sub_query in &decomposed.sub_queries {
                let expanded_terms = self.expand_terms(sub_query, &non_english).await;
                let fts_query = build_fts_query(sub_query, &expanded_terms);

                match self.channel_results(sub_query, &expanded_terms, &fts_query, effective_max, synthesis_mode).await {
                    Ok((vec_hits, fts_hits, graph_hits, entities)) => {
                        vec_total += vec_hits.len();
                        fts_total += fts_hits.len();
                        graph_total += graph_hits.len();
                        graph_entities.extend(entities);
                        fts_queries.push(fts_query);
                        sub_results.push(fuse(&vec_hits, &fts_hits, &graph_hits, effective));
                    }
                    Err(e) => {
                        warn!(error = %e, sub_query, "sub-query retrieval failed, skipping it");
                    }
                }
            }
        }

        let top: Vec<FusedEntry> = merge_round_robin(sub_results, effective_max, |entry| entry.0);

        let fts_query = fts_queries.join(" || ");
        graph_entities.sort_unstable();
        graph_entities.dedup();

        let chunk_ids: Vec<ChunkId> = top.iter().map(|(id, ..)| *id).collect();
        let chunks = self.store.chunks_by_ids(&chunk_ids).await?;
        let chunk_by_id: HashMap<ChunkId, Chunk> = chunks.into_iter().map(|c| (c.id, c)).collect();

        let filenames: HashMap<_, _> = self.store.list_documents().await?.into_iter().map(|d| (d.id, d.filename)).collect();

        let mut retrieved = Vec::with_capacity(top.len());
        let mut per_result = Vec::with_capacity(top.len());
        for (id, score, methods, vec_rank, fts_rank, graph_rank) in top {
            let Some(chunk) = chunk_by_id.get(&id) else { continue };
            let filename = filenames.get(&chunk.document_id).cloned().unwrap_or_default();
            retrieved.push(RetrievedChunk {
                chunk: chunk.clone(),
                document_filename: filename,
                fused_score: score,
                vec_rank,
                fts_rank,
                graph_rank,
            });
            per_result.push(PerResultTrace { chunk_id: id, methods, vec_rank, fts_rank, graph_rank });
        }

        let trace = RetrievalTrace {
            vec_results: vec_total,
            fts_results: fts_total,
            graph_results: graph_total,
            fused_results: retrieved.len(),
            vec_weight: effective.vector,
            fts_weight: effective.fts,
            graph_weight: effective.graph,
            identifiers_detected,
            synthesis_mode,
            max_requested: effective_max,
            follow_up_terms: None,
            follow_up_results: None,
            fts_query,
            graph_entities,
            elapsed_ms: started.elapsed().as_millis() as u64,
            per_result,
        };

        Ok((retrieved, trace))
    }

    async fn expand_terms(&self, query: &str, non_english: &[String]) -> Vec<String> {
        if non_english.is_empty() {
            return Vec::new();
        }
        let mut expanded_terms = Vec::new();
        for term in sanitized_tokens(query) {
            expanded_terms.extend(self.translator.expand_all(&term, non_english).await);
        }
        expanded_terms
    }

    /// Runs all three channels concurrently. A channel that errors degrades
    /// to an empty result and is logged, unless every channel errors — then
    /// the first channel's own error (vector, then fts, then graph) is
    /// returned rather than a generic failure.
    async fn channel_results(
        &self,
        query: &str,
        expanded_terms: &[String],
        fts_query: &str,
        k: usize,
        synthesis_mode: bool,
    ) -> Result<(Vec<(ChunkId, f32)>, Vec<(ChunkId, f32)>, Vec<(ChunkId, f32)>, Vec<String>)> {
        let (vec_result, fts_result, graph_result) = tokio::join!(
            self.vector_channel(query, k),
            self.fts_channel(fts_query, k),
            self.graph_channel(query, expanded_terms, k, synthesis_mode),
        );

        if vec_result.is_err() && fts_result.is_err() && graph_result.is_err() {
            return Err(vec_result.err().or_else(|| fts_result.err()).or_else(|| graph_result.err()).unwrap());
        }

        let vec_hits = vec_result.unwrap_or_else(|e| {
            warn!(error = %e, "vector channel failed");
            Vec::new()
        });
        let fts_hits = fts_result.unwrap_or_else(|e| {
            warn!(error = %e, "fts channel failed");
            Vec::new()
        });
        let (graph_hits, graph_entities) = graph_result.unwrap_or_else(|e| {
            warn!(error = %e, "graph channel failed");
            (Vec::new(), Vec::new())
        });

        Ok((vec_hits, fts_hits, graph_hits, graph_entities))
    }

    async fn vector_channel(&self, question: &str, k: usize) -> Result<Vec<(ChunkId, f32)>> {
        let vectors = self.embedder.embed(&[question.to_string()]).await?;
        let vector = vectors.into_iter().next().unwrap_or_default();
        self.store.vector_top_k(&vector, k).await
    }

    async fn fts_channel(&self, query: &str, k: usize) -> Result<Vec<(ChunkId, f32)>> {
        self.store.fts_top_k(query, k)
    }

    async fn graph_channel(&self, question: &str, expanded_terms: &[String], k: usize, synthesis_mode: bool) -> Result<(Vec<(ChunkId, f32)>, Vec<String>)> {
        let mut candidates = extract_graph_candidates(question);
        candidates.extend(expanded_terms.iter().cloned());
        let candidates: Vec<String> = candidates.into_iter().map(|c| c.to_lowercase()).collect::<HashSet<_>>().into_iter().collect();

        if candidates.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut entities = self.store.entities_by_names(&candidates).await?;
        if entities.is_empty() {
            entities = self.store.entities_by_substring(&candidates).await?;
        }
        if entities.is_empty() {
            entities = self.store.entities_by_english_name(&candidates).await?;
        }

        let mut entity_ids: Vec<_> = entities.iter().map(|e| e.id).collect();
        let entity_names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();

        if synthesis_mode && !entity_ids.is_empty() {
            let neighbors = self.store.related_entities(&entity_ids, GRAPH_NEIGHBOR_CAP).await?;
            let mut seen: HashSet<_> = entity_ids.iter().copied().collect();
            for n in neighbors {
                if seen.insert(n.id) {
                    entity_ids.push(n.id);
                }
            }
        }

        let hits = self.store.graph_top_k(&entity_ids, k).await?;
        Ok((hits, entity_names))
    }
}

fn is_synthesis_query(question: &str) -> bool {
    let lower = question.to_lowercase();
    if EXHAUSTIVE_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let words: Vec<&str> = question.split_whitespace().collect();
    if words.len() < 15 {
        return false;
    }
    let hits = INTERROGATIVE_KEYWORDS.iter().filter(|k| lower.contains(**k)).count();
    hits >= 2
}

fn sanitized_tokens(question: &str) -> Vec<String> {
    let cleaned = OPERATOR_CHARS.replace_all(question, " ");
    cleaned
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}

fn build_fts_query(question: &str, expanded_terms: &[String]) -> String {
    let phrase = OPERATOR_CHARS.replace_all(question.trim(), " ").trim().to_string();
    let tokens = sanitized_tokens(question);

    let mut parts = Vec::new();
    if !phrase.is_empty() {
        parts.push(format!("\"{phrase}\""));
    }
    parts.extend(tokens);
    parts.extend(expanded_terms.iter().cloned());

    parts.join(" OR ")
}

/// Candidate entity names from quoted terms, capitalized multi-word phrases,
/// standard-prefix identifiers, numeric section references, and remaining
/// significant lowercase tokens.
fn extract_graph_candidates(question: &str) -> Vec<String> {
    let mut out = Vec::new();

    for cap in QUOTED_TERM_RE.captures_iter(question) {
        out.push(cap[1].to_string());
    }
    for cap in CAPITALIZED_PHRASE_RE.captures_iter(question) {
        out.push(cap[1].to_string());
    }
    for ident in identifiers::extract(question) {
        out.push(ident);
    }
    for cap in SECTION_REF_RE.captures_iter(question) {
        out.push(cap[0].to_string());
    }
    out.extend(sanitized_tokens(question));

    out
}

type FusedEntry = (ChunkId, f32, Vec<RetrievalMethod>, Option<usize>, Option<usize>, Option<usize>);

fn fuse(vec_hits: &[(ChunkId, f32)], fts_hits: &[(ChunkId, f32)], graph_hits: &[(ChunkId, f32)], weights: RetrievalWeights) -> Vec<FusedEntry> {
    struct Acc {
        score: f32,
        methods: Vec<RetrievalMethod>,
        vec_rank: Option<usize>,
        fts_rank: Option<usize>,
        graph_rank: Option<usize>,
    }

    let mut scores: HashMap<ChunkId, Acc> = HashMap::new();

    let mut apply = |hits: &[(ChunkId, f32)], weight: f32, method: RetrievalMethod, set_rank: fn(&mut Acc, usize)| {
        for (rank, (id, _)) in hits.iter().enumerate() {
            let contribution = weight / (RRF_K + rank as f32 + 1.0);
            let entry = scores.entry(*id).or_insert_with(|| Acc { score: 0.0, methods: Vec::new(), vec_rank: None, fts_rank: None, graph_rank: None });
            entry.score += contribution;
            entry.methods.push(method);
            set_rank(entry, rank);
        }
    };

    apply(vec_hits, weights.vector, RetrievalMethod::Vector, |acc, r| acc.vec_rank = Some(r));
    apply(fts_hits, weights.fts, RetrievalMethod::Fts, |acc, r| acc.fts_rank = Some(r));
    apply(graph_hits, weights.graph, RetrievalMethod::Graph, |acc, r| acc.graph_rank = Some(r));

    let mut out: Vec<FusedEntry> = scores
        .into_iter()
        .map(|(id, acc)| (id, acc.score, acc.methods, acc.vec_rank, acc.fts_rank, acc.graph_rank))
        .collect();

    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_matches_worked_example() {
        let vec_hits = vec![(1, 0.9), (2, 0.8)];
        let fts_hits = vec![(2, 5.0), (3, 4.0)];
        let graph_hits = vec![(1, 1.0)];
        let weights = RetrievalWeights { vector: 1.0, fts: 1.0, graph: 0.5 };

        let fused = fuse(&vec_hits, &fts_hits, &graph_hits, weights);
        let scores: HashMap<ChunkId, f32> = fused.iter().map(|(id, s, ..)| (*id, *s)).collect();

        let expected_2 = 1.0 / 62.0 + 1.0 / 61.0;
        let expected_1 = 1.0 / 61.0 + 0.5 / 61.0;
        let expected_3 = 1.0 / 62.0;

        assert!((scores[&2] - expected_2).abs() < 1e-9);
        assert!((scores[&1] - expected_1).abs() < 1e-9);
        assert!((scores[&3] - expected_3).abs() < 1e-9);
        assert_eq!(fused[0].0, 2);
    }

    #[test]
    fn ties_break_on_smaller_chunk_id() {
        let vec_hits = vec![(5, 1.0)];
        let fts_hits = vec![(3, 1.0)];
        let weights = RetrievalWeights { vector: 1.0, fts: 1.0, graph: 1.0 };
        let fused = fuse(&vec_hits, &fts_hits, &[], weights);
        assert_eq!(fused[0].1, fused[1].1);
        assert_eq!(fused[0].0, 3);
    }

    #[test]
    fn synthesis_mode_detects_exhaustive_phrase() {
        assert!(is_synthesis_query("list all the ISO standards referenced"));
    }

    #[test]
    fn synthesis_mode_detects_long_interrogative_question() {
        let q = "what are the requirements and how do they apply when the system is operating under which conditions exactly";
        assert!(is_synthesis_query(q));
    }

    #[test]
    fn short_question_is_not_synthesis_mode() {
        assert!(!is_synthesis_query("what is ISO 9001"));
    }

    #[test]
    fn all_channels_empty_is_an_error() {
        // covered at the retrieve() level via the store; fuse() alone just
        // returns an empty vec, which is the degrade-gracefully path.
        let fused = fuse(&[], &[], &[], RetrievalWeights { vector: 1.0, fts: 1.0, graph: 1.0 });
        assert!(fused.is_empty());
    }
}
