//! Full-text index. Adapted from `search::text_search::TextSearch`: same
//! schema shape (`id` STRING|STORED so deletes work, `text`/`title` TEXT),
//! same `OnCommitWithDelay` reader and `delete_matching_source` segment-scan
//! idiom, keyed by stringified chunk id instead of a UUID.

use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::types::ChunkId;

pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    text_field: schema::Field,
    title_field: schema::Field,
}

impl TextIndex {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT | STORED);
        let title_field = sb.add_text_field("title", TEXT);
        (sb.build(), id_field, text_field, title_field)
    }

    pub fn open(data_dir: &Path) -> Result<Self> {
        let index_path = data_dir.join("fts_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, text_field, title_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema.clone())?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create tantivy reader")?;

        let writer = index.writer(50_000_000).context("failed to create tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            text_field,
            title_field,
        })
    }

    pub fn index_chunks(&self, rows: &[(ChunkId, &str, &str)]) -> Result<()> {
        let writer = self.writer.lock();
        for (id, text, title) in rows {
            writer.add_document(doc!(
                self.id_field => id.to_string(),
                self.text_field => *text,
                self.title_field => *title,
            ))?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("tantivy commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Sanitized query is the caller's responsibility (HybridRetriever builds
    /// the `"phrase" OR token1 OR token2` string per its own routing rules);
    /// this just parses and searches, falling back to a quoted-phrase parse
    /// on a syntax error the same way the teacher does.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<(ChunkId, f32)>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field, self.title_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped = query.replace('"', "");
                let fallback = QueryParser::for_index(&self.index, vec![self.text_field]);
                fallback.parse_query(&format!("\"{escaped}\""))?
            }
        };

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;
        let mut results = Vec::with_capacity(k);
        for (score, doc_address) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) {
                if let Some(id_val) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                    if let Ok(id) = id_val.parse::<ChunkId>() {
                        results.push((id, score));
                    }
                }
            }
        }
        Ok(results)
    }

    pub fn delete_by_id(&self, id: ChunkId) -> Result<()> {
        let writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.id_field, &id.to_string());
        writer.delete_term(term);
        Ok(())
    }

    pub fn delete_ids(&self, ids: &[ChunkId]) -> Result<()> {
        {
            let writer = self.writer.lock();
            for id in ids {
                let term = tantivy::Term::from_field_text(self.id_field, &id.to_string());
                writer.delete_term(term);
            }
        }
        self.commit()
    }

    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let searcher = self.reader.searcher();
        Ok(searcher.num_docs() as usize)
    }
}
