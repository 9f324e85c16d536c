//! Storage engine - SQLite store with three synchronized indexes.
//!
//! One database file holds the relational tables (`item`, `chunk`, `tag`,
//! `setting`), a sqlite-vec `vec0` virtual table keyed by chunk id, and a
//! contentless FTS5 table kept in sync by triggers. The engine is
//! single-writer: one connection behind a mutex, transactions serialized.
//! Embedding calls never happen while the lock is held.

pub mod operations;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::{Result, UridxError};

/// Setting key for the embedding model name.
pub const SETTING_EMBED_MODEL: &str = "embed_model";

/// Setting key for the persisted vector dimension.
pub const SETTING_EMBED_DIMENSION: &str = "embed_dimension";

/// Single-writer handle over the uridx store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Outcome of the startup repair scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    /// Items deleted because their expires_at has passed.
    pub expired_items: usize,
    /// Embedding rows deleted because their chunk is gone.
    pub orphan_embeddings: usize,
    /// Chunks that lacked an embedding and were re-embedded.
    pub reembedded_chunks: usize,
}

impl Database {
    /// Register the sqlite-vec auto-extension (must run before opening
    /// connections so every raw connection carries the vec0 module).
    fn register_vec_extension() {
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut rusqlite::ffi::sqlite3,
                    *mut *mut std::ffi::c_char,
                    *const rusqlite::ffi::sqlite3_api_routines,
                ) -> std::ffi::c_int,
            >(sqlite_vec::sqlite3_vec_init as *const ())));
        }
    }

    /// Open or create the store at `path` and bootstrap the schema.
    ///
    /// When the settings registry has no `embed_dimension` yet, the
    /// embedder is probed for its dimension and both `embed_model` and
    /// `embed_dimension` are persisted. An existing vector table with a
    /// different dimension is a fatal configuration error.
    pub fn open(path: &Path, embedder: &dyn Embedder) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Self::register_vec_extension();
        let conn = Connection::open(path)?;
        Self::bootstrap(conn, embedder)
    }

    /// In-memory store (for testing).
    pub fn open_in_memory(embedder: &dyn Embedder) -> Result<Self> {
        Self::register_vec_extension();
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn, embedder)
    }

    fn bootstrap(conn: Connection, embedder: &dyn Embedder) -> Result<Self> {
        schema::init_relational_schema(&conn)?;

        let dimension = match get_setting(&conn, SETTING_EMBED_DIMENSION)? {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                UridxError::Config(format!("invalid persisted embed_dimension: {raw}"))
            })?,
            None => {
                let dim = embedder.dimension().map_err(|e| {
                    UridxError::Config(format!(
                        "cannot determine embedding dimension at first bootstrap: {e}"
                    ))
                })?;
                set_setting(&conn, SETTING_EMBED_MODEL, embedder.model())?;
                set_setting(&conn, SETTING_EMBED_DIMENSION, &dim.to_string())?;
                info!(
                    "Bootstrapped settings: model={}, dimension={}",
                    embedder.model(),
                    dim
                );
                dim
            }
        };

        if let Some(stored_model) = get_setting(&conn, SETTING_EMBED_MODEL)? {
            if stored_model != embedder.model() {
                warn!(
                    "Store was built with embedding model '{}' but '{}' is configured; \
                     vector dimensions are validated on every write",
                    stored_model,
                    embedder.model()
                );
            }
        }

        if let Some(existing) = schema::existing_vec_dimension(&conn)? {
            if existing != dimension {
                return Err(UridxError::Config(format!(
                    "vector table dimension {existing} does not match persisted \
                     embed_dimension {dimension}"
                )));
            }
        }
        schema::init_vec_table(&conn, dimension)?;
        schema::init_fts_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure with the (locked) connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| UridxError::Config(format!("connection lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Persisted embedding dimension from the settings registry.
    pub fn embed_dimension(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let raw = get_setting(conn, SETTING_EMBED_DIMENSION)?.ok_or_else(|| {
                UridxError::Config("settings registry is missing embed_dimension".to_string())
            })?;
            raw.parse::<usize>()
                .map_err(|_| UridxError::Config(format!("invalid embed_dimension: {raw}")))
        })
    }

    /// Read one setting value.
    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| get_setting(conn, key))
    }

    /// KNN over the vector table. Returns `(chunk_id, distance)` with the
    /// `k` smallest distances, ascending.
    pub fn vector_knn(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f64)>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let blob = embedding_to_blob(query);
            let mut stmt = conn.prepare(
                "SELECT chunk_id, distance FROM chunk_embeddings
                 WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![blob, k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut hits = Vec::new();
            for row in rows {
                hits.push(row?);
            }
            Ok(hits)
        })
    }

    /// Top-n lexical matches, best (lowest BM25 rank) first. A query the
    /// FTS tokenizer rejects yields an empty list, not an error.
    pub fn fts_topn(&self, match_expr: &str, n: usize) -> Result<Vec<(i64, f64)>> {
        if match_expr.is_empty() || n == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let result = (|| -> rusqlite::Result<Vec<(i64, f64)>> {
                let mut stmt = conn.prepare(
                    "SELECT rowid, rank FROM chunks_fts
                     WHERE chunks_fts MATCH ?1 ORDER BY rank LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![match_expr, n as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
                })?;
                rows.collect()
            })();

            match result {
                Ok(hits) => Ok(hits),
                Err(e) => {
                    debug!("FTS query rejected ({}), treating as empty: {}", match_expr, e);
                    Ok(Vec::new())
                }
            }
        })
    }

    /// Startup repair scan: drop expired items, remove embedding rows whose
    /// chunk is gone, and re-embed chunks that lack an embedding row.
    pub fn repair(&self, embedder: &dyn Embedder) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        // Phase 1 (locked): expired items and orphaned embeddings.
        let missing: Vec<(i64, String)> = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let now = Utc::now().to_rfc3339();
            let expired: Vec<i64> = collect_ids(
                &tx,
                "SELECT id FROM item WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            for item_id in &expired {
                delete_item_rows(&tx, *item_id)?;
            }
            report.expired_items = expired.len();

            let orphans: Vec<i64> = collect_ids(
                &tx,
                "SELECT chunk_id FROM chunk_embeddings
                 WHERE chunk_id NOT IN (SELECT id FROM chunk)",
                [],
            )?;
            for chunk_id in &orphans {
                warn!("Repair: deleting orphaned embedding for chunk {chunk_id}");
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE chunk_id = ?1",
                    params![chunk_id],
                )?;
            }
            report.orphan_embeddings = orphans.len();

            let missing = {
                let mut stmt = tx.prepare(
                    "SELECT id, text FROM chunk
                     WHERE id NOT IN (SELECT chunk_id FROM chunk_embeddings)
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;
            Ok(missing)
        })?;

        if missing.is_empty() {
            return Ok(report);
        }

        // Phase 2 (unlocked): recompute the missing vectors.
        warn!("Repair: {} chunks lack embeddings, re-embedding", missing.len());
        let texts: Vec<&str> = missing.iter().map(|(_, t)| t.as_str()).collect();
        let vectors = match embedder.embed(&texts) {
            Ok(v) => v,
            Err(e) => {
                warn!("Repair: embedding service unavailable, leaving gaps for next scan: {e}");
                return Ok(report);
            }
        };

        // Phase 3 (locked): insert, skipping chunks deleted in between.
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for ((chunk_id, _), vector) in missing.iter().zip(vectors.iter()) {
                let still_there: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM chunk WHERE id = ?1",
                        params![chunk_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if still_there.is_none() {
                    continue;
                }
                tx.execute(
                    "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
                    params![chunk_id, embedding_to_blob(vector)],
                )?;
                report.reembedded_chunks += 1;
            }
            tx.commit()?;
            Ok(())
        })?;

        Ok(report)
    }
}

fn collect_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(UridxError::from)
}

/// Delete one item and everything slaved to it. Explicit row deletes so the
/// FTS triggers fire; the vector table has no triggers and is cleared here.
pub(crate) fn delete_item_rows(conn: &Connection, item_id: i64) -> Result<()> {
    let chunk_ids = collect_ids(
        conn,
        "SELECT id FROM chunk WHERE item_id = ?1",
        params![item_id],
    )?;
    for chunk_id in &chunk_ids {
        conn.execute(
            "DELETE FROM chunk_embeddings WHERE chunk_id = ?1",
            params![chunk_id],
        )?;
    }
    conn.execute("DELETE FROM chunk WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM tag WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM item WHERE id = ?1", params![item_id])?;
    Ok(())
}

pub(crate) fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM setting WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(UridxError::from)
}

pub(crate) fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO setting (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Pack an f32 vector as little-endian bytes, the only on-disk
/// representation of embeddings.
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

/// Unpack a little-endian f32 blob.
#[allow(dead_code)]
pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder {
        dim: usize,
    }

    impl Embedder for FixedEmbedder {
        fn model(&self) -> &str {
            "fixed-test-model"
        }

        fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5f32; self.dim]).collect())
        }
    }

    #[test]
    fn test_blob_roundtrip() {
        let original = vec![1.0f32, 2.5, -std::f32::consts::PI, 0.0, 100.0];
        let blob = embedding_to_blob(&original);
        let recovered = blob_to_embedding(&blob);
        assert_eq!(original.len(), recovered.len());
        for (a, b) in original.iter().zip(recovered.iter()) {
            assert!((a - b).abs() < 1e-7);
        }
    }

    #[test]
    fn bootstrap_persists_model_and_dimension() {
        let embedder = FixedEmbedder { dim: 4 };
        let db = Database::open_in_memory(&embedder).unwrap();

        assert_eq!(
            db.setting(SETTING_EMBED_MODEL).unwrap().as_deref(),
            Some("fixed-test-model")
        );
        assert_eq!(db.embed_dimension().unwrap(), 4);
    }

    #[test]
    fn reopen_with_different_dimension_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("uridx.db");

        let first = FixedEmbedder { dim: 4 };
        drop(Database::open(&path, &first).unwrap());

        // A provider now reporting a new dimension must not corrupt the
        // store: the persisted setting wins and writes are validated
        // against it (operations layer), while an out-of-band dimension
        // edit is caught here against the vec table DDL.
        let db = Database::open(&path, &FixedEmbedder { dim: 8 }).unwrap();
        assert_eq!(db.embed_dimension().unwrap(), 4);
        drop(db);

        let raw = {
            Database::register_vec_extension();
            Connection::open(&path).unwrap()
        };
        set_setting(&raw, SETTING_EMBED_DIMENSION, "8").unwrap();
        drop(raw);

        let err = Database::open(&path, &FixedEmbedder { dim: 8 }).unwrap_err();
        assert!(matches!(err, UridxError::Config(_)));
    }

    #[test]
    fn vector_knn_orders_by_distance() {
        let embedder = FixedEmbedder { dim: 2 };
        let db = Database::open_in_memory(&embedder).unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO item (source_uri, created_at, updated_at)
                 VALUES ('mem://a', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
            for (id, text) in [(1i64, "one"), (2, "two")] {
                conn.execute(
                    "INSERT INTO chunk (id, item_id, chunk_index, text) VALUES (?1, 1, ?1, ?2)",
                    params![id, text],
                )?;
            }
            conn.execute(
                "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (1, ?1)",
                params![embedding_to_blob(&[1.0, 0.0])],
            )?;
            conn.execute(
                "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (2, ?1)",
                params![embedding_to_blob(&[0.0, 1.0])],
            )?;
            Ok(())
        })
        .unwrap();

        let hits = db.vector_knn(&[0.9, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 < hits[1].1);
    }

    #[test]
    fn fts_rejection_is_empty_not_error() {
        let embedder = FixedEmbedder { dim: 2 };
        let db = Database::open_in_memory(&embedder).unwrap();
        // unbalanced quote is an FTS5 syntax error
        let hits = db.fts_topn("\"unterminated", 10).unwrap();
        assert!(hits.is_empty());
    }
}
