//! Append-only query log. Written once at the end of a query, never read
//! back by the engine itself — it exists for offline analysis, so the schema
//! favors simplicity over a rich query surface.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::types::QueryLogRecord;

const TABLE: &str = "query_log";

pub struct QueryLogStore {
    db: lancedb::Connection,
    next_id: AtomicI64,
}

impl QueryLogStore {
    pub async fn open(db: lancedb::Connection) -> Result<Self> {
        let names = db.table_names().execute().await?;
        if !names.contains(&TABLE.to_string()) {
            let schema = Self::schema();
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(vec![0i64])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(Float32Array::from(vec![0.0f32])),
                    Arc::new(StringArray::from(vec!["[]"])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                ],
            )?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
            db.create_table(TABLE, Box::new(reader)).execute().await?;
            let table = db.open_table(TABLE).execute().await?;
            table.delete("id = 0").await.ok();
        }
        let next_id = Self::max_id(&db).await?.wrapping_add(1);
        Ok(Self { db, next_id: AtomicI64::new(next_id) })
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("question", DataType::Utf8, false),
            Field::new("answer", DataType::Utf8, false),
            Field::new("confidence", DataType::Float32, false),
            Field::new("sources_used_json", DataType::Utf8, false),
            Field::new("model", DataType::Utf8, false),
            Field::new("rounds", DataType::UInt32, false),
            Field::new("prompt_tokens", DataType::UInt32, false),
            Field::new("completion_tokens", DataType::UInt32, false),
        ]))
    }

    async fn max_id(db: &lancedb::Connection) -> Result<i64> {
        let table = db.open_table(TABLE).execute().await?;
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

    pub async fn append(&self, question: &str, answer: &str, confidence: f32, sources_used: &[i64], model: &str, rounds: u32, prompt_tokens: u32, completion_tokens: u32) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let table = self.db.open_table(TABLE).execute().await?;
        let schema = Self::schema();
        let sources_json = serde_json::to_string(sources_used).unwrap_or_else(|_| "[]".to_string());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![id])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![question])),
                Arc::new(StringArray::from(vec![answer])),
                Arc::new(Float32Array::from(vec![confidence])),
                Arc::new(StringArray::from(vec![sources_json.as_str()])),
                Arc::new(StringArray::from(vec![model])),
                Arc::new(UInt32Array::from(vec![rounds])),
                Arc::new(UInt32Array::from(vec![prompt_tokens])),
                Arc::new(UInt32Array::from(vec![completion_tokens])),
            ],
        )?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(Box::new(reader)).execute().await.context("append query log")?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn recent(&self, limit: usize) -> Result<Vec<QueryLogRecord>> {
        let table = self.db.open_table(TABLE).execute().await?;
        let results = table.query().limit(limit).execute().await?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;

        let mut out = Vec::new();
        for batch in &batches {
            let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let questions = batch.column_by_name("question").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let answers = batch.column_by_name("answer").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let confidences = batch.column_by_name("confidence").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let sources_jsons = batch.column_by_name("sources_used_json").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let models = batch.column_by_name("model").and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let rounds = batch.column_by_name("rounds").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
            let prompt_tokens = batch.column_by_name("prompt_tokens").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
            let completion_tokens = batch.column_by_name("completion_tokens").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());

            let (Some(ids), Some(questions), Some(answers), Some(confidences), Some(sources_jsons), Some(models), Some(rounds), Some(prompt_tokens), Some(completion_tokens)) =
                (ids, questions, answers, confidences, sources_jsons, models, rounds, prompt_tokens, completion_tokens)
            else {
                continue;
            };

            for i in 0..batch.num_rows() {
                if ids.value(i) == 0 {
                    continue;
                }
                out.push(QueryLogRecord {
                    id: ids.value(i),
                    question: questions.value(i).to_string(),
                    answer: answers.value(i).to_string(),
                    confidence: confidences.value(i),
                    sources_used: serde_json::from_str(sources_jsons.value(i)).unwrap_or_default(),
                    model: models.value(i).to_string(),
                    rounds: rounds.value(i),
                    prompt_tokens: prompt_tokens.value(i),
                    completion_tokens: completion_tokens.value(i),
                });
            }
        }
        Ok(out)
    }
}
