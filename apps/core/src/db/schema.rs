//! Database schema - relational tables, FTS5 index with sync triggers,
//! vec0 vector table.
//!
//! The triggers are the only writer of `chunks_fts`; ingestion code never
//! touches the lexical index directly. The `context` column is sourced by a
//! correlated lookup on the owning item at trigger time, so an update to
//! `item.context` alone does not refresh existing FTS rows.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, UridxError};

/// Create the relational tables and performance pragmas. Idempotent.
pub fn init_relational_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;

         CREATE TABLE IF NOT EXISTS item (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_uri TEXT NOT NULL UNIQUE,
            title TEXT,
            source_type TEXT,
            context TEXT,
            expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS chunk (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id INTEGER NOT NULL REFERENCES item(id) ON DELETE CASCADE,
            chunk_key TEXT,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            meta TEXT
         );

         CREATE INDEX IF NOT EXISTS idx_chunk_item ON chunk(item_id);

         -- chunk_key is a stable identity within its item when present
         CREATE UNIQUE INDEX IF NOT EXISTS idx_chunk_item_key
            ON chunk(item_id, chunk_key) WHERE chunk_key IS NOT NULL;

         CREATE TABLE IF NOT EXISTS tag (
            item_id INTEGER NOT NULL REFERENCES item(id) ON DELETE CASCADE,
            tag TEXT NOT NULL,
            PRIMARY KEY (item_id, tag)
         );

         CREATE TABLE IF NOT EXISTS setting (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );",
    )?;

    Ok(())
}

/// Create the contentless FTS5 table and the chunk triggers that keep it
/// synchronized. Idempotent.
pub fn init_fts_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            context,
            content='',
            contentless_delete=1
         );

         CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunk BEGIN
            INSERT INTO chunks_fts(rowid, text, context)
            SELECT NEW.id, NEW.text, COALESCE(
                (SELECT context FROM item WHERE id = NEW.item_id), ''
            );
         END;

         CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunk BEGIN
            DELETE FROM chunks_fts WHERE rowid = OLD.id;
         END;

         CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunk BEGIN
            DELETE FROM chunks_fts WHERE rowid = OLD.id;
            INSERT INTO chunks_fts(rowid, text, context)
            SELECT NEW.id, NEW.text, COALESCE(
                (SELECT context FROM item WHERE id = NEW.item_id), ''
            );
         END;",
    )?;

    Ok(())
}

/// Create the sqlite-vec virtual table for chunk embeddings. Must be called
/// after the sqlite-vec extension is registered.
pub fn init_vec_table(conn: &Connection, dimension: usize) -> Result<()> {
    let sql = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_embeddings USING vec0(
            chunk_id INTEGER PRIMARY KEY,
            embedding float[{dimension}]
        );"
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Dimension of an existing `chunk_embeddings` table, parsed from its DDL
/// in sqlite_master. `None` when the table does not exist yet.
pub fn existing_vec_dimension(conn: &Connection) -> Result<Option<usize>> {
    let ddl: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'chunk_embeddings'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(ddl) = ddl else {
        return Ok(None);
    };

    parse_float_dimension(&ddl).map(Some).ok_or_else(|| {
        UridxError::Config(format!(
            "cannot determine vector dimension from existing chunk_embeddings table: {ddl}"
        ))
    })
}

fn parse_float_dimension(ddl: &str) -> Option<usize> {
    let start = ddl.find("float[")? + "float[".len();
    let rest = &ddl[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relational_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_relational_schema(&conn).unwrap();
        init_relational_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('item', 'chunk', 'tag', 'setting')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn fts_triggers_track_chunk_rows() {
        let conn = Connection::open_in_memory().unwrap();
        init_relational_schema(&conn).unwrap();
        init_fts_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO item (source_uri, context, created_at, updated_at)
             VALUES ('mem://a', 'shared background', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunk (item_id, chunk_index, text) VALUES (1, 0, 'alpha beta')",
            [],
        )
        .unwrap();

        // insert trigger indexed both text and item context
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        let by_context: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'background'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(by_context, 1);

        // update trigger replaces the row
        conn.execute("UPDATE chunk SET text = 'gamma' WHERE id = 1", [])
            .unwrap();
        let stale: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'beta'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stale, 0);

        // delete trigger removes the row
        conn.execute("DELETE FROM chunk WHERE id = 1", []).unwrap();
        let gone: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'gamma'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(gone, 0);
    }

    #[test]
    fn parses_dimension_from_ddl() {
        let ddl = "CREATE VIRTUAL TABLE chunk_embeddings USING vec0(
            chunk_id INTEGER PRIMARY KEY,
            embedding float[768]
        )";
        assert_eq!(parse_float_dimension(ddl), Some(768));
        assert_eq!(parse_float_dimension("no dimension here"), None);
    }
}
