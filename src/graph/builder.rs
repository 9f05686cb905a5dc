//! Per-chunk entity/relationship extraction. Persists through `Store`; the
//! teacher's `knowledge_graph::KnowledgeGraph` (an in-memory `petgraph::DiGraph`)
//! is superseded here since entities/relationships are now durable rows, but
//! the bounded-semaphore task-set idiom is carried from the same file's
//! concurrent traversal helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::identifiers;
use crate::llm::{ChatModel, ChatRequest};
use crate::store::Store;
use crate::types::{Chunk, ChunkId, EntityId, EntityType, RelationType};

const MIN_ELIGIBLE_TOKENS: u32 = 30;
const PER_CHUNK_TIMEOUT: Duration = Duration::from_secs(90);

pub struct GraphBuilderParams {
    pub concurrency: usize,
}

#[derive(Debug, Default)]
pub struct GraphBuildOutcome {
    pub eligible: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct GraphBuilder<'a> {
    store: &'a Store,
    chat: Arc<dyn ChatModel>,
    params: GraphBuilderParams,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(store: &'a Store, chat: Arc<dyn ChatModel>, params: GraphBuilderParams) -> Self {
        Self { store, chat, params }
    }

    /// Extracts and persists entities/relationships for every eligible chunk
    /// of one document. Fails only if every eligible chunk failed; a chunk
    /// failure never aborts its siblings.
    pub async fn build(&self, chunks: &[Chunk], cancel: CancellationToken) -> Result<GraphBuildOutcome> {
        let eligible: Vec<&Chunk> = chunks.iter().filter(|c| c.token_count >= MIN_ELIGIBLE_TOKENS).collect();
        if eligible.is_empty() {
            return Ok(GraphBuildOutcome::default());
        }

        let semaphore = Arc::new(Semaphore::new(self.params.concurrency.max(1)));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let errors: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = Vec::with_capacity(eligible.len());
        for chunk in eligible.iter().map(|c| (*c).clone()) {
            let semaphore = semaphore.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();
            let errors = errors.clone();
            let cancel = cancel.clone();
            let chat = self.chat.clone();
            let store_ptr: &Store = self.store;

            tasks.push(async move {
                let Ok(_permit) = semaphore.acquire().await else { return };
                if cancel.is_cancelled() {
                    return;
                }

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
                    res = tokio::time::timeout(PER_CHUNK_TIMEOUT, process_chunk(store_ptr, chat.as_ref(), &chunk)) => {
                        res.unwrap_or_else(|_| Err(anyhow::anyhow!("chunk {} extraction timed out", chunk.id)))
                    }
                };

                match outcome {
                    Ok(()) => {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!(chunk_id = chunk.id, error = %e, "graph extraction failed for chunk");
                        failed.fetch_add(1, Ordering::SeqCst);
                        errors.lock().push(format!("chunk {}: {e}", chunk.id));
                    }
                }
            });
        }

        futures::future::join_all(tasks).await;

        let succeeded = succeeded.load(Ordering::SeqCst);
        let failed = failed.load(Ordering::SeqCst);
        if succeeded == 0 && failed == eligible.len() {
            anyhow::bail!("graph extraction failed for all {} eligible chunks", eligible.len());
        }

        Ok(GraphBuildOutcome {
            eligible: eligible.len(),
            succeeded,
            failed,
            errors: errors.lock().clone(),
        })
    }
}

async fn process_chunk(store: &Store, chat: &dyn ChatModel, chunk: &Chunk) -> Result<()> {
    let hints = identifiers::extract(&chunk.content);

    let entities = extract_entities(chat, &chunk.content, &hints).await?;
    if entities.is_empty() {
        return Ok(());
    }

    let mut name_to_id: HashMap<String, EntityId> = HashMap::new();
    for e in &entities {
        let id = store.upsert_entity_and_link(&e.name, e.entity_type, &e.description, chunk.id).await?;
        name_to_id.insert(e.name.to_lowercase(), id);
    }

    if entities.len() < 2 {
        return Ok(());
    }

    let vocabulary: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
    let relationships = match extract_relationships(chat, &chunk.content, &vocabulary).await {
        Ok(rels) => rels,
        Err(e) => {
            warn!(chunk_id = chunk.id, error = %e, "relationship extraction failed, entities were still persisted");
            return Ok(());
        }
    };

    for r in relationships {
        let source_id = resolve_entity(store, &name_to_id, &r.source).await?;
        let target_id = resolve_entity(store, &name_to_id, &r.target).await?;
        let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
            warn!(chunk_id = chunk.id, source = %r.source, target = %r.target, "dropping relationship with unresolved endpoint");
            continue;
        };
        store
            .insert_relationship(source_id, target_id, r.relation_type, r.weight, Some(chunk.id), &r.description)
            .await?;
    }

    Ok(())
}

async fn resolve_entity(store: &Store, local: &HashMap<String, EntityId>, name: &str) -> Result<Option<EntityId>> {
    let lower = name.to_lowercase();
    if let Some(id) = local.get(&lower) {
        return Ok(Some(*id));
    }
    let found = store.entities_by_names(&[lower]).await?;
    Ok(found.into_iter().next().map(|e| e.id))
}

struct ExtractedEntity {
    name: String,
    entity_type: EntityType,
    description: String,
}

struct ExtractedRelationship {
    source: String,
    target: String,
    relation_type: RelationType,
    description: String,
    weight: f32,
}

const ENTITY_TYPES_PROMPT: &str = "person, organization, standard, clause, concept, term, regulation";

async fn extract_entities(chat: &dyn ChatModel, text: &str, hints: &[String]) -> Result<Vec<ExtractedEntity>> {
    let hint_line = if hints.is_empty() {
        String::new()
    } else {
        format!("\nDetected identifiers that may be entities or aid recognition: {}\n", hints.join(", "))
    };

    let system = format!(
        "You extract named entities from technical documents. Valid types: {ENTITY_TYPES_PROMPT}. \
         Respond with a single JSON object {{\"entities\": [{{\"name\": string, \"type\": string, \"description\": string}}]}}. \
         Entity names must be lowercase. Do not invent entities not present in the text."
    );
    let user = format!("{hint_line}\nText:\n{text}");

    let req = ChatRequest::new(&system, &user, 0.0).json_mode();
    let resp = chat.chat(&req).await?;
    let json = extract_json_object(&resp.content)?;

    #[derive(serde::Deserialize)]
    struct RawEntity {
        name: String,
        #[serde(rename = "type")]
        entity_type: String,
        #[serde(default)]
        description: String,
    }
    #[derive(serde::Deserialize)]
    struct RawEntities {
        entities: Vec<RawEntity>,
    }

    let parsed: RawEntities = serde_json::from_str(&json)?;
    Ok(parsed
        .entities
        .into_iter()
        .filter_map(|e| {
            let entity_type = EntityType::parse(&e.entity_type)?;
            Some(ExtractedEntity {
                name: e.name.to_lowercase(),
                entity_type,
                description: e.description,
            })
        })
        .collect())
}

async fn extract_relationships(chat: &dyn ChatModel, text: &str, vocabulary: &[String]) -> Result<Vec<ExtractedRelationship>> {
    let vocab_lower: Vec<String> = vocabulary.iter().map(|n| n.to_lowercase()).collect();
    let system = format!(
        "You extract relationships between a closed set of named entities: {}. \
         Valid relationship types: references, defines, amends, requires, contradicts, supersedes. \
         Respond with a single JSON object {{\"relationships\": [{{\"source\": string, \"target\": string, \"relation_type\": string, \"description\": string, \"weight\": number}}]}} \
         where source and target are drawn only from the entity list and weight is between 0 and 1.",
        vocab_lower.join(", ")
    );
    let user = format!("Text:\n{text}");

    let req = ChatRequest::new(&system, &user, 0.0).json_mode();
    let resp = chat.chat(&req).await?;
    let json = extract_json_object(&resp.content)?;

    #[derive(serde::Deserialize)]
    struct RawRelationship {
        source: String,
        target: String,
        relation_type: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        weight: f32,
    }
    #[derive(serde::Deserialize)]
    struct RawRelationships {
        relationships: Vec<RawRelationship>,
    }

    let parsed: RawRelationships = serde_json::from_str(&json)?;
    Ok(parsed
        .relationships
        .into_iter()
        .filter_map(|r| {
            let relation_type = RelationType::parse(&r.relation_type)?;
            let weight = if r.weight <= 0.0 { 1.0 } else { r.weight.min(1.0) };
            Some(ExtractedRelationship {
                source: r.source.to_lowercase(),
                target: r.target.to_lowercase(),
                relation_type,
                description: r.description,
                weight,
            })
        })
        .collect())
}

/// Strips markdown code fences and takes the substring from the first `{`
/// to the last `}`, tolerating chat models that wrap JSON in prose.
fn extract_json_object(content: &str) -> Result<String> {
    let stripped = content.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```");
    let start = stripped.find('{').ok_or_else(|| anyhow::anyhow!("no JSON object found in model output"))?;
    let end = stripped.rfind('}').ok_or_else(|| anyhow::anyhow!("no JSON object found in model output"))?;
    if end < start {
        anyhow::bail!("malformed JSON object in model output");
    }
    Ok(stripped[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        let content = "```json\n{\"entities\": []}\n```";
        assert_eq!(extract_json_object(content).unwrap(), "{\"entities\": []}");
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let content = "Sure, here is the result: {\"entities\": [{\"name\": \"iso 9001\"}]} hope that helps";
        let json = extract_json_object(content).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
    }
}
