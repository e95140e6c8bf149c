//! SQLite-backed vector index.
//!
//! Stores embedded chunks keyed by content hash and serves brute-force
//! cosine nearest-neighbor search with metadata filters. The index owns
//! chunk storage exclusively; retrieval and ingestion go through
//! [`VectorIndex`], never through SQL directly.
//!
//! Backing-store failures surface as
//! [`EngineError::IndexUnavailable`](crate::error::EngineError), which
//! callers treat as retryable.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{EngineError, EngineResult};
use crate::models::{Chunk, ReferenceDocument, ScoredChunk};

/// Metadata restrictions applied before similarity ranking.
#[derive(Debug, Clone, Default)]
pub struct IndexFilters {
    pub platform: Option<String>,
    pub technique: Option<String>,
}

impl IndexFilters {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.technique.is_none()
    }
}

/// Aggregate counts for operator inspection.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub chunks_by_platform: HashMap<String, i64>,
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update the reference document a set of chunks belongs to.
    pub async fn upsert_document(&self, doc: &ReferenceDocument) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reference_documents (id, title, path, platform, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                platform = excluded.platform,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.path)
        .bind(&doc.platform)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    /// Index a chunk keyed by its content hash.
    ///
    /// Idempotent: re-indexing identical text is a no-op. Returns whether
    /// a new row was written.
    pub async fn index_chunk(&self, chunk: &Chunk) -> EngineResult<bool> {
        let techniques_json = serde_json::to_string(&chunk.techniques)
            .map_err(|e| EngineError::Validation(format!("chunk techniques: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, text, embedding, platform, techniques_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(&chunk.text)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(&chunk.platform)
        .bind(&techniques_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    /// Top-k chunks by cosine similarity to `query_vector`, restricted to
    /// metadata matching `filters`.
    ///
    /// Results are ordered by descending similarity; ties break by
    /// insertion order (rowid ascending), so ranking is stable.
    pub async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        filters: &IndexFilters,
    ) -> EngineResult<Vec<ScoredChunk>> {
        let mut sql = String::from(
            "SELECT rowid, id, document_id, text, embedding, platform, techniques_json \
             FROM chunks WHERE 1=1",
        );
        if filters.platform.is_some() {
            sql.push_str(" AND platform = ?");
        }
        if filters.technique.is_some() {
            // techniques_json is a JSON array of quoted ids
            sql.push_str(" AND techniques_json LIKE '%\"' || ? || '\"%'");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref platform) = filters.platform {
            query = query.bind(platform);
        }
        if let Some(ref technique) = filters.technique {
            query = query.bind(technique);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(unavailable)?;

        let mut scored: Vec<(i64, ScoredChunk)> = rows
            .iter()
            .map(|row| {
                let rowid: i64 = row.get("rowid");
                let blob: Vec<u8> = row.get("embedding");
                let embedding = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vector, &embedding) as f64;
                let techniques: Vec<String> =
                    serde_json::from_str(row.get::<String, _>("techniques_json").as_str())
                        .unwrap_or_default();

                (
                    rowid,
                    ScoredChunk {
                        chunk: Chunk {
                            id: row.get("id"),
                            document_id: row.get("document_id"),
                            text: row.get("text"),
                            embedding,
                            platform: row.get("platform"),
                            techniques,
                        },
                        similarity,
                    },
                )
            })
            .collect();

        // Similarity desc, then insertion order for determinism
        scored.sort_by(|(a_rowid, a), (b_rowid, b)| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a_rowid.cmp(b_rowid))
        });
        scored.truncate(k);

        Ok(scored.into_iter().map(|(_, sc)| sc).collect())
    }

    /// Delete a reference document and all of its chunks.
    ///
    /// Chunks whose content hash is shared with another document survive
    /// under that document's ownership.
    pub async fn remove_document(&self, document_id: &str) -> EngineResult<u64> {
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?
            .rows_affected();

        sqlx::query("DELETE FROM reference_documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(deleted)
    }

    /// Look up a document by its file path, if it has been ingested before.
    pub async fn document_by_path(&self, path: &str) -> EngineResult<Option<ReferenceDocument>> {
        let row = sqlx::query(
            "SELECT id, title, path, platform, created_at, updated_at \
             FROM reference_documents WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| ReferenceDocument {
            id: row.get("id"),
            title: row.get("title"),
            path: row.get("path"),
            platform: row.get("platform"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn stats(&self) -> EngineResult<IndexStats> {
        let total_documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reference_documents")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        let rows = sqlx::query(
            "SELECT COALESCE(platform, '(none)') AS platform, COUNT(*) AS n \
             FROM chunks GROUP BY platform",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let chunks_by_platform = rows
            .iter()
            .map(|row| (row.get::<String, _>("platform"), row.get::<i64, _>("n")))
            .collect();

        Ok(IndexStats {
            total_documents,
            total_chunks,
            chunks_by_platform,
        })
    }
}

fn unavailable(e: sqlx::Error) -> EngineError {
    EngineError::IndexUnavailable(e.to_string())
}
