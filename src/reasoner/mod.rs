//! Multi-round answer/validate/refine loop. New relative to the teacher (no
//! single teacher file owns this shape), grounded on `rag::citation_validator`
//! for citation handling and on the `llm::ChatModel` capability trait for the
//! chat calls themselves.

mod citations;
mod validate;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::warn;

use crate::identifiers;
use crate::llm::{ChatModel, ChatRequest};
use crate::types::{Answer, MatchedCitation, ReasoningAction, ReasoningStep, RetrievalTrace, RetrievedChunk, Source, ValidationResult};

pub use citations::extract_and_match;

const FALSE_POSITIVE_PREFIXES: &[&str] = &["figure ", "fig ", "table ", "step ", "page ", "section ", "chapter ", "item ", "part ", "ref "];

pub struct ReasonerParams {
    pub max_rounds: u32,
    pub confidence_threshold: f32,
}

pub struct Reasoner {
    chat: Arc<dyn ChatModel>,
    params: ReasonerParams,
}

impl Reasoner {
    pub fn new(chat: Arc<dyn ChatModel>, params: ReasonerParams) -> Self {
        Self { chat, params }
    }

    pub async fn reason(&self, question: &str, retrieved: &[RetrievedChunk], trace: RetrievalTrace) -> Result<Answer> {
        let sources = to_sources(retrieved);
        let context = build_context(&sources);

        let mut steps = Vec::new();
        let mut prompt_tokens = 0u32;
        let mut completion_tokens = 0u32;

        let round1_started = Instant::now();
        let round1 = answer_round(self.chat.as_ref(), question, &context).await?;
        prompt_tokens += round1.prompt_tokens;
        completion_tokens += round1.completion_tokens;
        steps.push(ReasoningStep {
            round: 1,
            action: ReasoningAction::InitialAnswer,
            input: question.to_string(),
            output: round1.text.clone(),
            prompt: Some(round1.prompt.clone()),
            response: Some(round1.text.clone()),
            validation: None,
            chunks_used: sources.iter().map(|s| s.chunk_id).collect(),
            tokens: round1.prompt_tokens + round1.completion_tokens,
            elapsed_ms: round1_started.elapsed().as_millis() as u64,
            issues: Vec::new(),
        });

        if self.params.max_rounds < 2 {
            let confidence = validate::heuristic_confidence(&round1.text, &sources);
            let citations = citations_in(&round1.text, &sources);
            return Ok(self.finalize(round1.text, confidence, sources, steps, trace, citations, prompt_tokens, completion_tokens, 1));
        }

        let round2_started = Instant::now();
        let validation = validate::validate(&round1.text, &sources);
        steps.push(ReasoningStep {
            round: 2,
            action: ReasoningAction::Validation,
            input: round1.text.clone(),
            output: format!("confidence={:.2}", validation.confidence),
            prompt: None,
            response: None,
            validation: Some(validation.clone()),
            chunks_used: sources.iter().map(|s| s.chunk_id).collect(),
            tokens: 0,
            elapsed_ms: round2_started.elapsed().as_millis() as u64,
            issues: all_issues(&validation),
        });

        let mut final_text = round1.text.clone();
        let mut final_confidence = validation.confidence;
        let mut rounds = 2;

        if self.params.max_rounds >= 3 && validation.confidence < self.params.confidence_threshold {
            let round3_started = Instant::now();
            match refine_round(self.chat.as_ref(), question, &context, &round1.text, &validation).await {
                Ok(refined) => {
                    let re_validation = validate::validate(&refined.text, &sources);
                    prompt_tokens += refined.prompt_tokens;
                    completion_tokens += refined.completion_tokens;
                    steps.push(ReasoningStep {
                        round: 3,
                        action: ReasoningAction::Refinement,
                        input: round1.text.clone(),
                        output: refined.text.clone(),
                        prompt: Some(refined.prompt.clone()),
                        response: Some(refined.text.clone()),
                        validation: Some(re_validation.clone()),
                        chunks_used: sources.iter().map(|s| s.chunk_id).collect(),
                        tokens: refined.prompt_tokens + refined.completion_tokens,
                        elapsed_ms: round3_started.elapsed().as_millis() as u64,
                        issues: all_issues(&re_validation),
                    });
                    final_text = refined.text;
                    final_confidence = re_validation.confidence;
                    rounds = 3;
                }
                Err(e) => {
                    warn!(error = %e, "refinement round failed, falling back to round-1 answer");
                }
            }
        }

        let citations = citations_in(&final_text, &sources);
        Ok(self.finalize(final_text, final_confidence, sources, steps, trace, citations, prompt_tokens, completion_tokens, rounds))
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        text: String,
        confidence: f32,
        sources: Vec<Source>,
        reasoning: Vec<ReasoningStep>,
        retrieval_trace: RetrievalTrace,
        citations: Vec<MatchedCitation>,
        prompt_tokens: u32,
        completion_tokens: u32,
        rounds: u32,
    ) -> Answer {
        Answer {
            text,
            confidence,
            sources,
            reasoning,
            retrieval_trace,
            citations,
            model_used: self.chat.model_name().to_string(),
            rounds,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

fn all_issues(v: &ValidationResult) -> Vec<String> {
    v.citation_issues.iter().chain(v.consistency_issues.iter()).chain(v.completeness_issues.iter()).cloned().collect()
}

fn to_sources(retrieved: &[RetrievedChunk]) -> Vec<Source> {
    retrieved
        .iter()
        .map(|r| Source {
            chunk_id: r.chunk.id,
            document_id: r.chunk.document_id,
            filename: r.document_filename.clone(),
            content: r.chunk.content.clone(),
            heading: r.chunk.heading.clone(),
            page_number: r.chunk.page_number,
            score: r.fused_score,
        })
        .collect()
}

fn build_context(sources: &[Source]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "--- Source {}: {} | {} | Page {} ---\n{}",
                i + 1,
                s.filename,
                s.heading.as_deref().unwrap_or("(no heading)"),
                s.page_number.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
                s.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

struct RoundOutput {
    text: String,
    prompt: String,
    prompt_tokens: u32,
    completion_tokens: u32,
}

async fn answer_round(chat: &dyn ChatModel, question: &str, context: &str) -> Result<RoundOutput> {
    let system = "Answer only from the provided context. Cite the source filename, section/heading, or page for \
                  every claim. If the context is insufficient to answer, say so explicitly.";
    let user = format!("Context:\n{context}\n\nQuestion: {question}");
    let req = ChatRequest::new(system, &user, 0.0);
    let resp = chat.chat(&req).await?;
    Ok(RoundOutput { text: resp.content, prompt: user, prompt_tokens: resp.prompt_tokens, completion_tokens: resp.completion_tokens })
}

async fn refine_round(chat: &dyn ChatModel, question: &str, context: &str, prior_answer: &str, validation: &ValidationResult) -> Result<RoundOutput> {
    let issues: Vec<&str> = validation.citation_issues.iter().chain(validation.consistency_issues.iter()).chain(validation.completeness_issues.iter()).map(|s| s.as_str()).collect();
    let system = "Answer only from the provided context. Cite the source filename, section/heading, or page for \
                  every claim. Revise the previous answer to address the issues listed.";
    let user = format!(
        "Context:\n{context}\n\nQuestion: {question}\n\nPrevious answer:\n{prior_answer}\n\nIssues found:\n- {}",
        issues.join("\n- ")
    );
    let req = ChatRequest::new(system, &user, 0.0);
    let resp = chat.chat(&req).await?;
    Ok(RoundOutput { text: resp.content, prompt: user, prompt_tokens: resp.prompt_tokens, completion_tokens: resp.completion_tokens })
}

/// Identifier-shaped substrings in `answer` that do not appear in any
/// retrieved chunk's content, with prose-prefix false positives filtered.
pub fn missing_identifiers(answer: &str, retrieved: &[RetrievedChunk]) -> Vec<String> {
    let lower_contents: Vec<String> = retrieved.iter().map(|r| r.chunk.content.to_lowercase()).collect();
    let candidates = identifiers::extract(answer);

    candidates
        .into_iter()
        .filter(|c| {
            let lower = c.to_lowercase();
            if FALSE_POSITIVE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
                return false;
            }
            !lower_contents.iter().any(|content| content.contains(&lower))
        })
        .collect()
}

/// Citation extraction over the final answer text, for callers that want the
/// raw list alongside whatever chunk each citation resolved to (if any).
pub fn citations_in(answer: &str, sources: &[Source]) -> Vec<MatchedCitation> {
    citations::extract_and_match(answer, sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, ChunkType};

    fn retrieved_chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk { id: 1, document_id: 1, ordinal: 0, heading: None, content: content.to_string(), chunk_type: ChunkType::Text, page_number: None, token_count: 10 },
            document_filename: "a.pdf".to_string(),
            fused_score: 1.0,
            vec_rank: Some(0),
            fts_rank: None,
            graph_rank: None,
        }
    }

    #[test]
    fn missing_identifier_not_in_corpus_survives() {
        let retrieved = vec![retrieved_chunk("ISO 9001 requires quality management")];
        let missing = missing_identifiers("The corpus also mentions ISO 14001 standards.", &retrieved);
        assert!(missing.iter().any(|m| m.to_uppercase().contains("14001")));
    }

    #[test]
    fn identifier_present_in_corpus_does_not_survive() {
        let retrieved = vec![retrieved_chunk("ISO 9001 requires quality management")];
        let missing = missing_identifiers("This references ISO 9001.", &retrieved);
        assert!(missing.is_empty());
    }

    #[test]
    fn false_positive_prefix_is_filtered() {
        let retrieved = vec![retrieved_chunk("nothing relevant here")];
        let missing = missing_identifiers("See Table 3000 for details.", &retrieved);
        assert!(!missing.iter().any(|m| m.to_lowercase().starts_with("table")));
    }
}
