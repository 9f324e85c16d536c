//! uridx core library
//!
//! A local, single-node knowledge index: heterogeneous text-bearing content
//! (conversations, markdown sections, PDF pages, image descriptions) is
//! ingested as chunked items and served back through hybrid retrieval that
//! fuses vector similarity with full-text search.
//!
//! One SQLite file holds three synchronized indexes: the relational tables,
//! a sqlite-vec `vec0` table of chunk embeddings, and a trigger-maintained
//! FTS5 table. Extractors live outside this crate and feed the JSONL
//! ingestion contract ([`db::operations::IngestRecord`]).

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod mcp;
pub mod search;

// Re-export main types
pub use config::Config;
pub use db::operations::{
    add_item, delete_item, get_item, get_stats, ChunkInput, IngestRecord, ItemView, Stats,
};
pub use db::{Database, RepairReport};
pub use embedding::{provider::EmbeddingProvider, Embedder};
pub use error::{Result, UridxError};
pub use search::{hybrid_search, SearchResult};
