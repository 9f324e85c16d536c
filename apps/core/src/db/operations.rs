//! Item operations - transactional ingestion, lookup, delete, stats.
//!
//! `add_item` is the ingestion pipeline: embeddings for the incoming chunks
//! are computed before the write transaction, then relational rows and
//! embedding rows commit together. A failed embedding call therefore aborts
//! the ingestion with nothing written, and the store never holds a chunk
//! without its vector. FTS rows are maintained by triggers only.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{delete_item_rows, embedding_to_blob, Database};
use crate::embedding::Embedder;
use crate::error::{Result, UridxError};

/// One chunk of an ingestion record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    pub text: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

/// One line of the JSONL ingestion contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub source_uri: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub chunks: Vec<ChunkInput>,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IngestRecord {
    /// Convenience constructor for single-chunk additions (the `add` tool
    /// and `ingest --text`).
    pub fn single_chunk(source_uri: &str, text: &str) -> Self {
        Self {
            source_uri: source_uri.to_string(),
            title: None,
            source_type: None,
            context: None,
            tags: Vec::new(),
            chunks: vec![ChunkInput {
                text: text.to_string(),
                key: None,
                meta: None,
            }],
            replace: false,
            expires_at: None,
        }
    }
}

/// A stored chunk, ordered by `chunk_index`.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub id: i64,
    pub key: Option<String>,
    pub chunk_index: i64,
    pub text: String,
    pub meta: Option<serde_json::Value>,
}

/// A stored item with its chunks and tags loaded.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub source_uri: String,
    pub title: Option<String>,
    pub source_type: Option<String>,
    pub context: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
    pub chunks: Vec<ChunkView>,
    pub tags: Vec<String>,
}

/// Store-wide counts.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub items: usize,
    pub chunks: usize,
    pub tags: usize,
    pub embeddings: usize,
    pub source_types: BTreeMap<String, usize>,
}

/// Upsert one item with its chunks and tags.
///
/// - No existing item: plain insert, `chunk_index` = position.
/// - Existing item, `replace`: the old item is deleted first (new chunk
///   ids, per the replace contract).
/// - Existing item, merge: chunks are matched by `chunk_key`; matched
///   chunks keep their id and get new text/meta/index, unmatched existing
///   chunks (including all null-key chunks) are deleted, the tag set is
///   replaced, and every incoming chunk is re-embedded.
pub fn add_item(
    db: &Database,
    embedder: &dyn Embedder,
    record: &IngestRecord,
) -> Result<ItemView> {
    if record.source_uri.trim().is_empty() {
        return Err(UridxError::Input("record is missing source_uri".to_string()));
    }

    let accepted = accept_chunks(&record.source_uri, &record.chunks);

    // Embed before taking the write lock; a transient failure aborts the
    // whole ingestion with nothing committed.
    let texts: Vec<&str> = accepted.iter().map(|c| c.text.as_str()).collect();
    let vectors = if texts.is_empty() {
        Vec::new()
    } else {
        embedder.embed(&texts)?
    };

    let dimension = db.embed_dimension()?;
    for vector in &vectors {
        if vector.len() != dimension {
            return Err(UridxError::Config(format!(
                "embedding dimension {} does not match persisted embed_dimension {}",
                vector.len(),
                dimension
            )));
        }
    }
    if vectors.len() != accepted.len() {
        return Err(UridxError::Transient(format!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            accepted.len()
        )));
    }

    let item_id = db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        let mut existing_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM item WHERE source_uri = ?1",
                params![record.source_uri],
                |row| row.get(0),
            )
            .optional()?;

        if record.replace {
            if let Some(id) = existing_id.take() {
                delete_item_rows(&tx, id)?;
            }
        }

        let expires_at = record.expires_at.map(|t| t.to_rfc3339());
        let item_id = match existing_id {
            Some(id) => {
                tx.execute(
                    "UPDATE item SET title = ?1, source_type = ?2, context = ?3,
                        expires_at = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        record.title,
                        record.source_type,
                        record.context,
                        expires_at,
                        now,
                        id
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO item
                        (source_uri, title, source_type, context, expires_at,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        record.source_uri,
                        record.title,
                        record.source_type,
                        record.context,
                        expires_at,
                        now
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        // Key diff: existing chunks whose key is absent from the incoming
        // set are deleted; null-key chunks can never match and go with
        // them. Embedding rows first (no triggers there), chunk rows after
        // (FTS cleanup via trigger).
        let incoming_keys: HashSet<&str> = accepted
            .iter()
            .filter_map(|c| c.key.as_deref())
            .collect();

        let existing_chunks: Vec<(i64, Option<String>)> = {
            let mut stmt =
                tx.prepare("SELECT id, chunk_key FROM chunk WHERE item_id = ?1")?;
            let rows = stmt.query_map(params![item_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut existing_by_key: HashMap<String, i64> = HashMap::new();
        for (chunk_id, key) in existing_chunks {
            match key {
                Some(k) if incoming_keys.contains(k.as_str()) => {
                    existing_by_key.insert(k, chunk_id);
                }
                _ => {
                    tx.execute(
                        "DELETE FROM chunk_embeddings WHERE chunk_id = ?1",
                        params![chunk_id],
                    )?;
                    tx.execute("DELETE FROM chunk WHERE id = ?1", params![chunk_id])?;
                }
            }
        }

        let mut chunk_ids: Vec<i64> = Vec::with_capacity(accepted.len());
        for (idx, chunk) in accepted.iter().enumerate() {
            let meta_json = chunk
                .meta
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let matched = chunk
                .key
                .as_deref()
                .and_then(|k| existing_by_key.get(k).copied());
            let chunk_id = match matched {
                Some(id) => {
                    tx.execute(
                        "UPDATE chunk SET text = ?1, meta = ?2, chunk_index = ?3 WHERE id = ?4",
                        params![chunk.text, meta_json, idx as i64, id],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO chunk (item_id, chunk_key, chunk_index, text, meta)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![item_id, chunk.key, idx as i64, chunk.text, meta_json],
                    )?;
                    tx.last_insert_rowid()
                }
            };
            chunk_ids.push(chunk_id);
        }

        // Replace the tag set, duplicates collapsed
        tx.execute("DELETE FROM tag WHERE item_id = ?1", params![item_id])?;
        let tag_set: BTreeSet<&str> = record
            .tags
            .iter()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .collect();
        for tag in tag_set {
            tx.execute(
                "INSERT INTO tag (item_id, tag) VALUES (?1, ?2)",
                params![item_id, tag],
            )?;
        }

        // Fresh embeddings for every chunk in the incoming set; matched
        // chunks may have new text, so stale vectors are dropped wholesale.
        for (chunk_id, vector) in chunk_ids.iter().zip(vectors.iter()) {
            tx.execute(
                "DELETE FROM chunk_embeddings WHERE chunk_id = ?1",
                params![chunk_id],
            )?;
            tx.execute(
                "INSERT INTO chunk_embeddings (chunk_id, embedding) VALUES (?1, ?2)",
                params![chunk_id, embedding_to_blob(vector)],
            )?;
        }

        tx.commit()?;
        Ok(item_id)
    })?;

    db.with_conn(|conn| {
        load_item_view(conn, item_id)?.ok_or_else(|| {
            UridxError::Input(format!("item vanished after upsert: {}", record.source_uri))
        })
    })
}

/// Remove an item and everything slaved to it. Returns `true` when
/// something was removed.
pub fn delete_item(db: &Database, source_uri: &str) -> Result<bool> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let item_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM item WHERE source_uri = ?1",
                params![source_uri],
                |row| row.get(0),
            )
            .optional()?;

        let Some(item_id) = item_id else {
            return Ok(false);
        };

        delete_item_rows(&tx, item_id)?;
        tx.commit()?;
        Ok(true)
    })
}

/// Fetch an item with ordered chunks and tags, or `None`.
pub fn get_item(db: &Database, source_uri: &str) -> Result<Option<ItemView>> {
    db.with_conn(|conn| {
        let item_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM item WHERE source_uri = ?1",
                params![source_uri],
                |row| row.get(0),
            )
            .optional()?;

        match item_id {
            Some(id) => load_item_view(conn, id),
            None => Ok(None),
        }
    })
}

/// Store-wide counts, items grouped by source_type (NULL as "unknown").
pub fn get_stats(db: &Database) -> Result<Stats> {
    db.with_conn(|conn| {
        let items: i64 = conn.query_row("SELECT COUNT(*) FROM item", [], |row| row.get(0))?;
        let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunk", [], |row| row.get(0))?;
        let tags: i64 = conn.query_row("SELECT COUNT(*) FROM tag", [], |row| row.get(0))?;
        let embeddings: i64 =
            conn.query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |row| row.get(0))?;

        let mut source_types = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT source_type, COUNT(*) FROM item GROUP BY source_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (source_type, count) = row?;
            source_types.insert(
                source_type.unwrap_or_else(|| "unknown".to_string()),
                count as usize,
            );
        }

        Ok(Stats {
            items: items as usize,
            chunks: chunks as usize,
            tags: tags as usize,
            embeddings: embeddings as usize,
            source_types,
        })
    })
}

/// Drop empty-text chunks (with a warning) and collapse duplicate keys,
/// last occurrence winning in place. The surviving order defines
/// `chunk_index`.
fn accept_chunks(source_uri: &str, chunks: &[ChunkInput]) -> Vec<ChunkInput> {
    let mut accepted: Vec<ChunkInput> = Vec::with_capacity(chunks.len());
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for chunk in chunks {
        if chunk.text.trim().is_empty() {
            warn!(
                "Skipping chunk with empty text (key: {:?}) for {}",
                chunk.key, source_uri
            );
            continue;
        }
        match &chunk.key {
            Some(key) => match by_key.get(key) {
                Some(&pos) => {
                    warn!(
                        "Duplicate chunk key '{}' for {}, last one wins",
                        key, source_uri
                    );
                    accepted[pos] = chunk.clone();
                }
                None => {
                    by_key.insert(key.clone(), accepted.len());
                    accepted.push(chunk.clone());
                }
            },
            None => accepted.push(chunk.clone()),
        }
    }

    accepted
}

pub(crate) fn load_item_view(conn: &Connection, item_id: i64) -> Result<Option<ItemView>> {
    let header = conn
        .query_row(
            "SELECT source_uri, title, source_type, context, created_at, updated_at, expires_at
             FROM item WHERE id = ?1",
            params![item_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((source_uri, title, source_type, context, created_at, updated_at, expires_at)) =
        header
    else {
        return Ok(None);
    };

    let mut chunks = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, chunk_key, chunk_index, text, meta
             FROM chunk WHERE item_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![item_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (id, key, chunk_index, text, meta_json) = row?;
            let meta = meta_json
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?;
            chunks.push(ChunkView {
                id,
                key,
                chunk_index,
                text,
                meta,
            });
        }
    }

    let mut tags = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT tag FROM tag WHERE item_id = ?1 ORDER BY tag")?;
        let rows = stmt.query_map(params![item_id], |row| row.get::<_, String>(0))?;
        for row in rows {
            tags.push(row?);
        }
    }

    Ok(Some(ItemView {
        source_uri,
        title,
        source_type,
        context,
        created_at,
        updated_at,
        expires_at,
        chunks,
        tags,
    }))
}
