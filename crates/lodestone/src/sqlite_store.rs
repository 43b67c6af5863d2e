//! SQLite-backed [`Store`] implementation.
//!
//! All collections share one `chunks` table keyed by
//! `(collection, dataset_id, id)`. Dense vectors are little-endian f32
//! BLOBs, sparse vectors and provenance are JSON. Similarity is computed
//! in Rust over the rows that pass the SQL-side filters.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use lodestone_core::embedding::{blob_to_vec, vec_to_blob};
use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::{Chunk, Position, PositionKind, Provenance, Scope, SparseVector};
use lodestone_core::store::{
    check_dims, rank_collection, Candidate, Store, StoreQuery, UpsertReport,
};

const DIMS_KEY: &str = "dense_dims";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> LodestoneError {
    LodestoneError::storage(e)
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let kind: String = row.try_get("position_kind").map_err(db_err)?;
    let start: i64 = row.try_get("position_start").map_err(db_err)?;
    let end: i64 = row.try_get("position_end").map_err(db_err)?;
    let part: i64 = row.try_get("position_part").map_err(db_err)?;
    let scope: String = row.try_get("scope").map_err(db_err)?;
    let dense: Vec<u8> = row.try_get("dense").map_err(db_err)?;
    let sparse_json: Option<String> = row.try_get("sparse_json").map_err(db_err)?;
    let provenance_json: String = row.try_get("provenance_json").map_err(db_err)?;

    let sparse_vector = match sparse_json {
        Some(json) => Some(serde_json::from_str::<SparseVector>(&json).map_err(LodestoneError::storage)?),
        None => None,
    };
    let provenance: Provenance =
        serde_json::from_str(&provenance_json).map_err(LodestoneError::storage)?;

    Ok(Chunk {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        scope: scope.parse::<Scope>()?,
        source_key: row.try_get("source_key").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        content_hash: row.try_get("content_hash").map_err(db_err)?,
        summary: row.try_get("summary").map_err(db_err)?,
        position: Position::from_parts(kind.parse::<PositionKind>()?, start as u64, end as u64),
        part: part as u32,
        is_code: row.try_get::<i64, _>("is_code").map_err(db_err)? != 0,
        language: row.try_get("language").map_err(db_err)?,
        code_confidence: row.try_get::<f64, _>("code_confidence").map_err(db_err)? as f32,
        dense_vector: blob_to_vec(&dense),
        sparse_vector,
        embedding_model: row.try_get("embedding_model").map_err(db_err)?,
        provenance,
        indexed_at: row.try_get("indexed_at").map_err(db_err)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let Some(first) = chunks.first() else {
            return Ok(report);
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Write first so the transaction holds the write lock before reading.
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(DIMS_KEY)
            .bind(first.dense_vector.len().to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let stored: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(DIMS_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let dims = stored.parse::<usize>().map_err(LodestoneError::storage)?;
        check_dims(Some(dims), chunks)?;

        for chunk in chunks {
            let kind = chunk.position.kind().as_str();
            let start = chunk.position.start() as i64;

            let replaced = sqlx::query(
                r#"
                DELETE FROM chunks
                WHERE collection = ? AND dataset_id = ? AND source_key = ?
                  AND position_kind = ? AND position_start = ? AND position_part = ?
                  AND id <> ?
                "#,
            )
            .bind(collection)
            .bind(&chunk.dataset_id)
            .bind(&chunk.source_key)
            .bind(kind)
            .bind(start)
            .bind(chunk.part as i64)
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM chunks WHERE collection = ? AND dataset_id = ? AND id = ?",
            )
            .bind(collection)
            .bind(&chunk.dataset_id)
            .bind(&chunk.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            let sparse_json = chunk
                .sparse_vector
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(LodestoneError::storage)?;
            let provenance_json =
                serde_json::to_string(&chunk.provenance).map_err(LodestoneError::storage)?;

            sqlx::query(
                r#"
                INSERT INTO chunks (collection, dataset_id, id, project_id, scope, source_key,
                                    position_kind, position_start, position_end, position_part,
                                    content, content_hash, summary, is_code, language,
                                    code_confidence, dense, sparse_json, embedding_model,
                                    provenance_json, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, dataset_id, id) DO UPDATE SET
                    project_id = excluded.project_id,
                    scope = excluded.scope,
                    position_end = excluded.position_end,
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    summary = excluded.summary,
                    is_code = excluded.is_code,
                    language = excluded.language,
                    code_confidence = excluded.code_confidence,
                    dense = excluded.dense,
                    sparse_json = excluded.sparse_json,
                    embedding_model = excluded.embedding_model,
                    provenance_json = excluded.provenance_json,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(collection)
            .bind(&chunk.dataset_id)
            .bind(&chunk.id)
            .bind(&chunk.project_id)
            .bind(chunk.scope.as_str())
            .bind(&chunk.source_key)
            .bind(kind)
            .bind(start)
            .bind(chunk.position.end() as i64)
            .bind(chunk.part as i64)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(&chunk.summary)
            .bind(chunk.is_code as i64)
            .bind(&chunk.language)
            .bind(chunk.code_confidence as f64)
            .bind(vec_to_blob(&chunk.dense_vector))
            .bind(sparse_json)
            .bind(&chunk.embedding_model)
            .bind(provenance_json)
            .bind(chunk.indexed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if exists || replaced > 0 {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(report)
    }

    async fn search(&self, collection: &str, query: &StoreQuery) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM chunks WHERE collection = ");
        qb.push_bind(collection);

        if let Some(ids) = &query.filter.dataset_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND dataset_id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(project_id) = &query.filter.project_id {
            qb.push(" AND project_id = ").push_bind(project_id.as_str());
        }
        if let Some(language) = &query.filter.language {
            qb.push(" AND language = ").push_bind(language.as_str());
        }
        if let Some(is_code) = query.filter.is_code {
            qb.push(" AND is_code = ").push_bind(is_code as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let chunks = rows.iter().map(row_to_chunk).collect::<Result<Vec<_>>>()?;

        // Remaining filters (repo, source prefix) are applied in rank_collection.
        Ok(rank_collection(collection, &chunks, query))
    }

    async fn existing_ids(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
    ) -> Result<BTreeSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE collection = ? AND dataset_id = ? AND source_key = ?",
        )
        .bind(collection)
        .bind(dataset_id)
        .bind(source_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(ids.into_iter().collect())
    }

    async fn prune(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
        keep: &BTreeSet<String>,
    ) -> Result<usize> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM chunks WHERE collection = ");
        qb.push_bind(collection);
        qb.push(" AND dataset_id = ").push_bind(dataset_id);
        qb.push(" AND source_key = ").push_bind(source_key);
        if !keep.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in keep {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");
        }
        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, collection: &str, dataset_id: Option<&str>) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE collection = ? AND (? IS NULL OR dataset_id = ?)",
        )
        .bind(collection)
        .bind(dataset_id)
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as usize)
    }

    async fn collections(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT collection FROM chunks ORDER BY collection")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}
