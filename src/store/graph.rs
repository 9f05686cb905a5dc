//! Entity / relationship / entity-chunk-link tables. New persisted tables —
//! the teacher's `graph::knowledge_graph::KnowledgeGraph` is process-lifetime
//! only (a `petgraph::DiGraph`) — but the column-building idiom (seed record,
//! Arrow `RecordBatch`, `only_if` predicate queries) is carried over from
//! `storage::lance_store::LanceStore`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::types::{ChunkId, Entity, EntityId, EntityType, RelationType, Relationship, RelationshipId};

const ENTITY_TABLE: &str = "entities";
const RELATIONSHIP_TABLE: &str = "relationships";
const LINK_TABLE: &str = "entity_chunk_links";

pub struct GraphStore {
    db: lancedb::Connection,
    next_entity_id: AtomicI64,
    next_relationship_id: AtomicI64,
}

impl GraphStore {
    pub async fn open(db: lancedb::Connection) -> Result<Self> {
        Self::ensure_entity_table(&db).await?;
        Self::ensure_relationship_table(&db).await?;
        Self::ensure_link_table(&db).await?;

        let next_entity_id = Self::max_id(&db, ENTITY_TABLE).await?.wrapping_add(1);
        let next_relationship_id = Self::max_id(&db, RELATIONSHIP_TABLE).await?.wrapping_add(1);

        Ok(Self {
            db,
            next_entity_id: AtomicI64::new(next_entity_id),
            next_relationship_id: AtomicI64::new(next_relationship_id),
        })
    }

    async fn max_id(db: &lancedb::Connection, table_name: &str) -> Result<i64> {
        let table = db.open_table(table_name).execute().await?;
        let results = table.query().select(lancedb::query::Select::columns(&["id"])).execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        let mut max = 0i64;
        for batch in &batches {
            if let Some(col) = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<Int64Array>()) {
                for i in 0..col.len() {
                    max = max.max(col.value(i));
                }
            }
        }
        Ok(max)
    }

    fn entity_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("entity_type", DataType::Utf8, false),
            Field::new("description", DataType::Utf8, false),
            Field::new("canonical_english_name", DataType::Utf8, true),
        ]))
    }

    async fn ensure_entity_table(db: &lancedb::Connection) -> Result<()> {
        let names = db.table_names().execute().await?;
        if names.contains(&ENTITY_TABLE.to_string()) {
            return Ok(());
        }
        let schema = Self::entity_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![0i64])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(StringArray::from(vec!["concept"])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![None::<&str>])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        db.create_table(ENTITY_TABLE, Box::new(reader)).execute().await?;
        let table = db.open_table(ENTITY_TABLE).execute().await?;
        table.delete("id = 0").await.ok();
        Ok(())
    }

    fn relationship_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("source_entity_id", DataType::Int64, false),
            Field::new("target_entity_id", DataType::Int64, false),
            Field::new("relation_type", DataType::Utf8, false),
            Field::new("weight", DataType::Float32, false),
            Field::new("source_chunk_id", DataType::Int64, true),
            Field::new("description", DataType::Utf8, false),
        ]))
    }

    async fn ensure_relationship_table(db: &lancedb::Connection) -> Result<()> {
        let names = db.table_names().execute().await?;
        if names.contains(&RELATIONSHIP_TABLE.to_string()) {
            return Ok(());
        }
        let schema = Self::relationship_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![0i64])) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
                Arc::new(Int64Array::from(vec![0i64])),
                Arc::new(StringArray::from(vec!["references"])),
                Arc::new(Float32Array::from(vec![0.0f32])),
                Arc::new(Int64Array::from(vec![None::<i64>])),
                Arc::new(StringArray::from(vec![""])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        db.create_table(RELATIONSHIP_TABLE, Box::new(reader)).execute().await?;
        let table = db.open_table(RELATIONSHIP_TABLE).execute().await?;
        table.delete("id = 0").await.ok();
        Ok(())
    }

    fn link_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("entity_id", DataType::Int64, false),
            Field::new("chunk_id", DataType::Int64, false),
        ]))
    }

    async fn ensure_link_table(db: &lancedb::Connection) -> Result<()> {
        let names = db.table_names().execute().await?;
        if names.contains(&LINK_TABLE.to_string()) {
            return Ok(());
        }
        let schema = Self::link_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![0i64])) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        db.create_table(LINK_TABLE, Box::new(reader)).execute().await?;
        let table = db.open_table(LINK_TABLE).execute().await?;
        table.delete("entity_id = 0 AND chunk_id = 0").await.ok();
        Ok(())
    }

    /// Upsert-by-lowercase-name, then link to `chunk_id`, as one logical unit
    /// (sequential awaits on a single-writer store — no interleaved writer
    /// can observe a half-applied entity).
    pub async fn upsert_entity_and_link(
        &self,
        name: &str,
        entity_type: EntityType,
        description: &str,
        chunk_id: ChunkId,
    ) -> Result<EntityId> {
        let lower = name.to_lowercase();
        let entity_id = match self.find_by_name(&lower).await? {
            Some(existing) => existing.id,
            None => {
                let id = self.next_entity_id.fetch_add(1, Ordering::SeqCst);
                let table = self.db.open_table(ENTITY_TABLE).execute().await?;
                let schema = Self::entity_schema();
                let batch = RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(Int64Array::from(vec![id])) as Arc<dyn Array>,
                        Arc::new(StringArray::from(vec![lower.as_str()])),
                        Arc::new(StringArray::from(vec![entity_type.as_str()])),
                        Arc::new(StringArray::from(vec![description])),
                        Arc::new(StringArray::from(vec![None::<&str>])),
                    ],
                )?;
                let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
                table.add(Box::new(reader)).execute().await.context("insert entity")?;
                id
            }
        };

        let table = self.db.open_table(LINK_TABLE).execute().await?;
        let schema = Self::link_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![entity_id])) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![chunk_id])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("insert entity-chunk link")?;

        Ok(entity_id)
    }

    pub async fn insert_relationship(
        &self,
        source_entity_id: EntityId,
        target_entity_id: EntityId,
        relation_type: RelationType,
        weight: f32,
        source_chunk_id: Option<ChunkId>,
        description: &str,
    ) -> Result<RelationshipId> {
        let weight = if weight <= 0.0 { 1.0 } else { weight };
        let id = self.next_relationship_id.fetch_add(1, Ordering::SeqCst);
        let table = self.db.open_table(RELATIONSHIP_TABLE).execute().await?;
        let schema = Self::relationship_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![id])) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![source_entity_id])),
                Arc::new(Int64Array::from(vec![target_entity_id])),
                Arc::new(StringArray::from(vec![relation_type.as_str()])),
                Arc::new(Float32Array::from(vec![weight])),
                Arc::new(Int64Array::from(vec![source_chunk_id])),
                Arc::new(StringArray::from(vec![description])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("insert relationship")?;
        Ok(id)
    }

    pub async fn find_by_name(&self, lowercase_name: &str) -> Result<Option<Entity>> {
        let table = self.db.open_table(ENTITY_TABLE).execute().await?;
        let predicate = format!("name = '{}'", lowercase_name.replace('\'', "''"));
        let results = table.query().only_if(predicate).limit(1).execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(Self::entity_rows(&batches).into_iter().next())
    }

    pub async fn entities_by_names(&self, names: &[String]) -> Result<Vec<Entity>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let list = names
            .iter()
            .map(|n| format!("'{}'", n.to_lowercase().replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        self.entities_by_predicate(&format!("name IN ({list})")).await
    }

    pub async fn entities_by_substring(&self, terms: &[String]) -> Result<Vec<Entity>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = terms
            .iter()
            .map(|t| format!("name LIKE '%{}%'", t.to_lowercase().replace('\'', "''").replace('%', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.entities_by_predicate(&clauses).await
    }

    pub async fn entities_by_english_name(&self, terms: &[String]) -> Result<Vec<Entity>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = terms
            .iter()
            .map(|t| format!("canonical_english_name = '{}'", t.to_lowercase().replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.entities_by_predicate(&clauses).await
    }

    async fn entities_by_predicate(&self, predicate: &str) -> Result<Vec<Entity>> {
        let table = self.db.open_table(ENTITY_TABLE).execute().await?;
        let results = table.query().only_if(predicate).execute().await.context("entity predicate query")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(Self::entity_rows(&batches))
    }

    /// 1-hop neighborhood of `seed_ids`, capped at `limit`.
    pub async fn related_entities(&self, seed_ids: &[EntityId], limit: usize) -> Result<Vec<Entity>> {
        if seed_ids.is_empty() {
            return Ok(Vec::new());
        }
        let seed_list = seed_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let table = self.db.open_table(RELATIONSHIP_TABLE).execute().await?;
        let predicate = format!("source_entity_id IN ({seed_list}) OR target_entity_id IN ({seed_list})");
        let results = table.query().only_if(predicate).execute().await.context("relationship neighbor query")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut neighbor_ids = std::collections::HashSet::new();
        let seed_set: std::collections::HashSet<EntityId> = seed_ids.iter().copied().collect();
        for batch in &batches {
            let sources = batch.column_by_name("source_entity_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let targets = batch.column_by_name("target_entity_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            if let (Some(sources), Some(targets)) = (sources, targets) {
                for i in 0..batch.num_rows() {
                    let (s, t) = (sources.value(i), targets.value(i));
                    if seed_set.contains(&s) && !seed_set.contains(&t) {
                        neighbor_ids.insert(t);
                    }
                    if seed_set.contains(&t) && !seed_set.contains(&s) {
                        neighbor_ids.insert(s);
                    }
                }
            }
        }

        let ids: Vec<EntityId> = neighbor_ids.into_iter().take(limit).collect();
        self.entities_by_ids(&ids).await
    }

    pub async fn entities_by_ids(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        self.entities_by_predicate(&format!("id IN ({list})")).await
    }

    /// Chunks linked to any of `entity_ids`, scored by the count of distinct
    /// matched seed entities linking to each chunk (there is no per-link
    /// weight in the data model; weighting by relationship strength would
    /// require a join this store intentionally keeps out of the hot path).
    pub async fn graph_top_k(&self, entity_ids: &[EntityId], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = entity_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let table = self.db.open_table(LINK_TABLE).execute().await?;
        let results = table.query().only_if(format!("entity_id IN ({list})")).execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut scores: std::collections::HashMap<ChunkId, f32> = std::collections::HashMap::new();
        for batch in &batches {
            let chunk_ids = batch.column_by_name("chunk_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            if let Some(chunk_ids) = chunk_ids {
                for i in 0..batch.num_rows() {
                    *scores.entry(chunk_ids.value(i)).or_insert(0.0) += 1.0;
                }
            }
        }

        let mut ranked: Vec<(ChunkId, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        Ok(ranked)
    }

    /// Deletes every `entity_chunk_links` row and every `relationships` row
    /// whose `source_chunk_id` points at one of `chunk_ids`. Entities
    /// themselves are left in place — they may still be referenced by other
    /// documents' chunks.
    pub async fn delete_by_chunk_ids(&self, chunk_ids: &[ChunkId]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let list = chunk_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");

        let links = self.db.open_table(LINK_TABLE).execute().await?;
        links.delete(&format!("chunk_id IN ({list})")).await.context("delete entity-chunk links for document")?;

        let relationships = self.db.open_table(RELATIONSHIP_TABLE).execute().await?;
        relationships
            .delete(&format!("source_chunk_id IN ({list})"))
            .await
            .context("delete relationships sourced from document")?;

        Ok(())
    }

    pub async fn all_entities(&self) -> Result<Vec<Entity>> {
        let table = self.db.open_table(ENTITY_TABLE).execute().await?;
        let results = table.query().execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(Self::entity_rows(&batches))
    }

    pub async fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let table = self.db.open_table(RELATIONSHIP_TABLE).execute().await?;
        let results = table.query().execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut rels = Vec::new();
        for batch in &batches {
            let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let sources = batch.column_by_name("source_entity_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let targets = batch.column_by_name("target_entity_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let types = batch.column_by_name("relation_type").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let weights = batch.column_by_name("weight").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let chunk_ids = batch.column_by_name("source_chunk_id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let descriptions = batch.column_by_name("description").and_then(|c| c.as_any().downcast_ref::<StringArray>());

            let (Some(ids), Some(sources), Some(targets), Some(types), Some(weights), Some(descriptions)) =
                (ids, sources, targets, types, weights, descriptions)
            else {
                continue;
            };

            for i in 0..batch.num_rows() {
                if ids.value(i) == 0 {
                    continue;
                }
                rels.push(Relationship {
                    id: ids.value(i),
                    source_entity_id: sources.value(i),
                    target_entity_id: targets.value(i),
                    relation_type: RelationType::parse(types.value(i)).unwrap_or(RelationType::References),
                    weight: weights.value(i),
                    source_chunk_id: chunk_ids.and_then(|c| if c.is_null(i) { None } else { Some(c.value(i)) }),
                    description: descriptions.value(i).to_string(),
                });
            }
        }
        Ok(rels)
    }

    fn entity_rows(batches: &[RecordBatch]) -> Vec<Entity> {
        let mut out = Vec::new();
        for batch in batches {
            let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let names = batch.column_by_name("name").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let types = batch.column_by_name("entity_type").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let descriptions = batch.column_by_name("description").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let canonical = batch.column_by_name("canonical_english_name").and_then(|c| c.as_any().downcast_ref::<StringArray>());

            let (Some(ids), Some(names), Some(types), Some(descriptions)) = (ids, names, types, descriptions) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                if ids.value(i) == 0 {
                    continue;
                }
                out.push(Entity {
                    id: ids.value(i),
                    name: names.value(i).to_string(),
                    entity_type: EntityType::parse(types.value(i)).unwrap_or(EntityType::Concept),
                    description: descriptions.value(i).to_string(),
                    canonical_english_name: canonical.and_then(|c| if c.is_null(i) { None } else { Some(c.value(i).to_string()) }),
                });
            }
        }
        out
    }
}
