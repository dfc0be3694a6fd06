//! SQLite persistence for the vector index.
//!
//! Vectors are written as little-endian f32 blobs, already normalized, so
//! `load(save())` reproduces query results exactly.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{IndexInner, PassageSnapshot, StoredEntry, VectorIndex};
use crate::core::errors::RagError;
use crate::ingest::loader::DocMeta;

async fn open_pool(path: &Path) -> Result<SqlitePool, RagError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(RagError::internal)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), RagError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS index_entries (
            passage_id TEXT PRIMARY KEY,
            vector BLOB NOT NULL,
            document_id TEXT NOT NULL,
            source_uri TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            span_start INTEGER NOT NULL DEFAULT 0,
            span_end INTEGER NOT NULL DEFAULT 0,
            content TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            product_category TEXT NOT NULL DEFAULT '',
            effective_date TEXT
        )",
    )
    .execute(pool)
    .await
    .map_err(RagError::internal)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(RagError::internal)?;

    Ok(())
}

fn serialize_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl VectorIndex {
    /// Persist all entries to a SQLite file, replacing previous contents.
    pub async fn save(&self, path: &Path) -> Result<(), RagError> {
        let pool = open_pool(path).await?;
        init_schema(&pool).await?;

        let inner = self.inner.read().await;

        let mut tx = pool.begin().await.map_err(RagError::internal)?;

        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;
        sqlx::query("DELETE FROM index_meta")
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;

        if let Some(model_id) = &inner.model_id {
            sqlx::query("INSERT INTO index_meta (key, value) VALUES ('model_id', ?1)")
                .bind(model_id)
                .execute(&mut *tx)
                .await
                .map_err(RagError::internal)?;
        }
        if let Some(dim) = inner.dim {
            sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dim', ?1)")
                .bind(dim.to_string())
                .execute(&mut *tx)
                .await
                .map_err(RagError::internal)?;
        }

        for entry in &inner.entries {
            sqlx::query(
                "INSERT INTO index_entries
                    (passage_id, vector, document_id, source_uri, ordinal,
                     span_start, span_end, content, title, product_category,
                     effective_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )
            .bind(&entry.passage_id)
            .bind(serialize_vector(&entry.vector))
            .bind(&entry.snapshot.document_id)
            .bind(&entry.snapshot.source_uri)
            .bind(entry.snapshot.ordinal as i64)
            .bind(entry.snapshot.char_span.0 as i64)
            .bind(entry.snapshot.char_span.1 as i64)
            .bind(&entry.snapshot.text)
            .bind(&entry.snapshot.meta.title)
            .bind(&entry.snapshot.meta.product_category)
            .bind(&entry.snapshot.meta.effective_date)
            .execute(&mut *tx)
            .await
            .map_err(RagError::internal)?;
        }

        tx.commit().await.map_err(RagError::internal)?;
        pool.close().await;

        tracing::info!("saved {} index entries to {}", inner.entries.len(), path.display());
        Ok(())
    }

    /// Restore an index from a SQLite file produced by `save`.
    pub async fn load(path: &Path) -> Result<Self, RagError> {
        if !path.exists() {
            return Err(RagError::SourceUnavailable(path.display().to_string()));
        }
        let pool = open_pool(path).await?;
        init_schema(&pool).await?;

        let model_id: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'model_id'")
                .fetch_optional(&pool)
                .await
                .map_err(RagError::internal)?;
        let dim: Option<usize> =
            sqlx::query_scalar::<_, String>("SELECT value FROM index_meta WHERE key = 'dim'")
                .fetch_optional(&pool)
                .await
                .map_err(RagError::internal)?
                .and_then(|v| v.parse().ok());

        let rows = sqlx::query(
            "SELECT passage_id, vector, document_id, source_uri, ordinal,
                    span_start, span_end, content, title, product_category,
                    effective_date
             FROM index_entries",
        )
        .fetch_all(&pool)
        .await
        .map_err(RagError::internal)?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut by_id = HashMap::with_capacity(rows.len());
        for row in rows {
            let vector_bytes: Vec<u8> = row.get("vector");
            let passage_id: String = row.get("passage_id");
            let ordinal: i64 = row.get("ordinal");
            let span_start: i64 = row.get("span_start");
            let span_end: i64 = row.get("span_end");

            by_id.insert(passage_id.clone(), entries.len());
            entries.push(StoredEntry {
                passage_id,
                vector: deserialize_vector(&vector_bytes),
                snapshot: PassageSnapshot {
                    document_id: row.get("document_id"),
                    source_uri: row.get("source_uri"),
                    ordinal: ordinal as usize,
                    text: row.get("content"),
                    char_span: (span_start as usize, span_end as usize),
                    meta: DocMeta {
                        title: row.get("title"),
                        product_category: row.get("product_category"),
                        effective_date: row.get("effective_date"),
                    },
                },
            });
        }
        pool.close().await;

        tracing::info!("loaded {} index entries from {}", entries.len(), path.display());

        Ok(VectorIndex {
            inner: tokio::sync::RwLock::new(IndexInner {
                dim,
                model_id,
                entries,
                by_id,
            }),
        })
    }
}
