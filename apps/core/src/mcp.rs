//! MCP (Model Context Protocol) server for uridx.
//!
//! Exposes the knowledge index to AI assistants over stdio:
//! - `search` - hybrid (vector + keyword) retrieval with filters
//! - `add`    - store a single-chunk item
//! - `delete` - remove an item and all its indexed content
//! - `get`    - fetch a full item by source_uri
//!
//! Tool output is always JSON text; failures are structured
//! `{"error": ...}` values rather than protocol errors. Stdout is protocol
//! data, so all logging goes to stderr.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext, ServerHandler},
    model::*,
    service::{RequestContext, RoleServer, ServiceExt},
    tool, tool_router,
    transport::io::stdio,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::db::operations::{add_item, delete_item, get_item, IngestRecord};
use crate::db::Database;
use crate::embedding::provider::EmbeddingProvider;
use crate::search::hybrid_search;

/// Type alias for MCP error data.
type McpError = rmcp::model::ErrorData;

/// Hard cap on the `limit` parameter.
const MAX_LIMIT: usize = 1000;

/// uridx MCP server. Owns one engine handle and one embedding client for
/// the process lifetime.
#[derive(Clone)]
pub struct UridxServer {
    db: Arc<Database>,
    embedder: Arc<EmbeddingProvider>,
    tool_router: ToolRouter<Self>,
}

// ============ TOOL PARAMETERS ============

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchParams {
    /// Natural language search query
    query: String,
    /// Maximum number of results (default 10, max 1000)
    limit: Option<usize>,
    /// Filter by source type (e.g., "note", "markdown", "pdf")
    source_type: Option<String>,
    /// Filter to items carrying all of these tags
    tags: Option<Vec<String>>,
    /// Use semantic search in addition to keyword search (default true)
    semantic: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddParams {
    /// Unique identifier for this item (e.g., URL or custom URI)
    source_uri: String,
    /// Human-readable title
    title: String,
    /// The content to store and index
    text: String,
    /// Category of content (default "note")
    source_type: Option<String>,
    /// Optional tags for filtering
    tags: Option<Vec<String>>,
    /// Optional additional context indexed for keyword relevance
    context: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DeleteParams {
    /// The unique identifier of the item to delete
    source_uri: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetParams {
    /// The unique identifier of the item to retrieve
    source_uri: String,
}

// ============ TOOL IMPLEMENTATIONS ============

#[tool_router]
impl UridxServer {
    /// Create a server over an opened engine and embedding client.
    pub fn new(db: Arc<Database>, embedder: Arc<EmbeddingProvider>) -> Self {
        Self {
            db,
            embedder,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "search",
        description = "Search the uridx knowledge base. Combines semantic (vector) and keyword (FTS) retrieval; supports source_type and tag filters.",
        annotations(read_only_hint = true)
    )]
    async fn search(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);

        self.run_blocking(move || {
            if p.query.trim().is_empty() {
                return json!({"error": "'query' must not be empty"});
            }
            let limit = p.limit.unwrap_or(10);
            if limit == 0 || limit > MAX_LIMIT {
                return json!({
                    "error": format!("'limit' must be between 1 and {MAX_LIMIT}")
                });
            }

            let tags = p.tags.unwrap_or_default();
            match hybrid_search(
                &db,
                embedder.as_ref(),
                &p.query,
                limit,
                p.source_type.as_deref(),
                &tags,
                p.semantic.unwrap_or(true),
            ) {
                Ok(results) => serde_json::to_value(&results)
                    .unwrap_or_else(|e| json!({"error": e.to_string()})),
                Err(e) => json!({"error": e.to_string()}),
            }
        })
        .await
    }

    #[tool(
        name = "add",
        description = "Add an item to the uridx knowledge base. The text is indexed for both semantic and keyword search."
    )]
    async fn add(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<AddParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);

        self.run_blocking(move || {
            if p.source_uri.trim().is_empty() {
                return json!({"error": "'source_uri' must not be empty"});
            }

            let mut record = IngestRecord::single_chunk(&p.source_uri, &p.text);
            record.title = Some(p.title.clone());
            record.source_type = Some(p.source_type.unwrap_or_else(|| "note".to_string()));
            record.context = p.context;
            record.tags = p.tags.unwrap_or_default();

            match add_item(&db, embedder.as_ref(), &record) {
                Ok(item) => json!({
                    "status": "added",
                    "source_uri": item.source_uri,
                    "title": p.title,
                }),
                Err(e) => json!({"error": e.to_string()}),
            }
        })
        .await
    }

    #[tool(
        name = "delete",
        description = "Delete an item from the uridx knowledge base, removing all its indexed content."
    )]
    async fn delete(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<DeleteParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let db = Arc::clone(&self.db);

        self.run_blocking(move || {
            if p.source_uri.trim().is_empty() {
                return json!({"error": "'source_uri' must not be empty"});
            }
            match delete_item(&db, &p.source_uri) {
                Ok(deleted) => json!({
                    "status": if deleted { "deleted" } else { "not_found" },
                    "source_uri": p.source_uri,
                }),
                Err(e) => json!({"error": e.to_string()}),
            }
        })
        .await
    }

    #[tool(
        name = "get",
        description = "Retrieve a specific item by its source_uri, including all chunks and tags.",
        annotations(read_only_hint = true)
    )]
    async fn get(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<GetParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let db = Arc::clone(&self.db);

        self.run_blocking(move || {
            if p.source_uri.trim().is_empty() {
                return json!({"error": "'source_uri' must not be empty"});
            }
            match get_item(&db, &p.source_uri) {
                Ok(Some(item)) => json!({
                    "source_uri": item.source_uri,
                    "title": item.title,
                    "source_type": item.source_type,
                    "context": item.context,
                    "created_at": item.created_at,
                    "updated_at": item.updated_at,
                    "chunks": item.chunks.iter().map(|c| json!({
                        "text": c.text,
                        "key": c.key,
                    })).collect::<Vec<_>>(),
                    "tags": item.tags,
                }),
                Ok(None) => serde_json::Value::Null,
                Err(e) => json!({"error": e.to_string()}),
            }
        })
        .await
    }
}

impl UridxServer {
    /// Bridge a blocking storage call into the async tool handler and
    /// render the outcome as JSON text content.
    async fn run_blocking<F>(&self, f: F) -> Result<CallToolResult, McpError>
    where
        F: FnOnce() -> serde_json::Value + Send + 'static,
    {
        let value = tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let text = serde_json::to_string_pretty(&value)
            .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

// ============ SERVER HANDLER ============

impl ServerHandler for UridxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "uridx".to_string(),
                title: Some("uridx knowledge index".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "uridx: local hybrid knowledge index. Use search(query=\"...\") to find \
                 content, add(source_uri=..., title=..., text=...) to store notes, \
                 get(source_uri=...) for full items, delete(source_uri=...) to remove them."
                    .to_string(),
            ),
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_context = ToolCallContext::new(self, request, context);
        async move { self.tool_router.call(tool_context).await }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools = self.tool_router.list_all();
        std::future::ready(Ok(ListToolsResult {
            tools,
            ..Default::default()
        }))
    }
}

/// Open the store, run the repair scan, and serve MCP on stdio.
///
/// This is the entry point for the `uridx serve` command.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder = Arc::new(EmbeddingProvider::new(&config.embedding));
    let db = Arc::new(Database::open(&config.db_path, embedder.as_ref())?);

    let report = db.repair(embedder.as_ref())?;
    if report.expired_items + report.orphan_embeddings + report.reembedded_chunks > 0 {
        info!(
            "Startup repair: {} expired items, {} orphan embeddings, {} chunks re-embedded",
            report.expired_items, report.orphan_embeddings, report.reembedded_chunks
        );
    }

    let server = UridxServer::new(db, embedder);

    let (stdin, stdout) = stdio();
    let service = server
        .serve((stdin, stdout))
        .await
        .map_err(|e| anyhow::anyhow!("MCP server failed to start: {:?}", e))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {:?}", e))?;

    Ok(())
}
