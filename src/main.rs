use std::sync::Arc;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

mod config;
mod connectors;
mod error;
mod graph;
mod ids;
mod model;
mod retry;
mod search;

use config::Config;
use error::SourceError;
use graph::CitationGraphBuilder;
use model::{Direction, SortBy};
use search::Aggregator;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Sources to query (arxiv, pubmed, semanticscholar, googlescholar); default all enabled")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Maximum results per source (default 10, max 100)")]
    max_results: Option<u32>,
    #[schemars(description = "'relevance' (default) or 'date'")]
    sort_by: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PaperIdParams {
    #[schemars(description = "Paper ID as <source>:<id> (e.g. arxiv:2106.14843, pubmed:34265844) or a landing-page URL")]
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BuildGraphParams {
    #[schemars(description = "Seed paper IDs or URLs")]
    seeds: Vec<String>,
    #[schemars(description = "Traversal depth (default 1, max 3)")]
    depth: Option<u32>,
    #[schemars(description = "'cites', 'cited_by' or 'both' (default)")]
    direction: Option<String>,
    #[schemars(description = "Maximum nodes in the graph (default 50, max 500)")]
    max_nodes: Option<u32>,
    #[schemars(description = "Fetch metadata for every node (slower)")]
    include_metadata: Option<bool>,
}

#[derive(Debug, Serialize)]
struct FulltextReport {
    id: String,
    available: bool,
    size_bytes: usize,
    is_pdf: bool,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ScholarGraphServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    aggregator: Arc<Aggregator>,
}

#[tool_router]
impl ScholarGraphServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let executor = Arc::new(config.build_executor());
        let connectors = config.build_connectors(&executor)?;

        tracing::info!(
            "Initialized {} source(s), timeout={:?}, max_retries={}",
            connectors.len(),
            config.timeout,
            config.max_retries
        );

        let aggregator = Aggregator::new(connectors, executor, config.timeout);
        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            aggregator: Arc::new(aggregator),
        })
    }

    #[tool(description = "List available paper sources and their status")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        json_result(&self.config.source_status())
    }

    #[tool(description = "Search papers across sources concurrently. Returns deduplicated results, per-source errors and a partial flag.")]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let max = params.max_results.unwrap_or(10).clamp(1, 100) as usize;
        let sort_by = match params.sort_by.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("relevance") => SortBy::Relevance,
            Some("date") => SortBy::Date,
            Some(other) => {
                return Err(McpError::invalid_params(
                    format!("Unknown sort_by '{}': expected 'relevance' or 'date'", other),
                    None,
                ))
            }
        };
        let names = params.sources.unwrap_or_default();

        let result = self
            .aggregator
            .search_all_named(&params.query, &names, max, sort_by)
            .await
            .map_err(to_mcp_error)?;
        json_result(&result)
    }

    #[tool(description = "Get metadata for one paper by ID (arxiv:ID, pubmed:PMID, semanticscholar:ID, googlescholar:CLUSTER) or URL")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<PaperIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = ids::resolve(&params.id).map_err(to_mcp_error)?;
        match self.aggregator.fetch_metadata(&id).await {
            Ok(paper) => json_result(&paper),
            Err(SourceError::NotFound(_)) => Ok(CallToolResult::success(vec![Content::text(
                format!("Paper not found: {}", id),
            )])),
            Err(e) => Err(to_mcp_error(e)),
        }
    }

    #[tool(description = "Check whether full text (PDF) can be retrieved for a paper; reports its size")]
    async fn get_fulltext(
        &self,
        Parameters(params): Parameters<PaperIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = ids::resolve(&params.id).map_err(to_mcp_error)?;
        let bytes = self
            .aggregator
            .fetch_fulltext(&id)
            .await
            .map_err(to_mcp_error)?;
        let report = FulltextReport {
            id: ids::format(&id),
            available: bytes.is_some(),
            size_bytes: bytes.as_ref().map_or(0, Vec::len),
            is_pdf: bytes.as_ref().is_some_and(|b| b.starts_with(b"%PDF")),
        };
        json_result(&report)
    }

    #[tool(description = "Build a citation graph by breadth-first traversal from seed papers")]
    async fn build_citation_graph(
        &self,
        Parameters(params): Parameters<BuildGraphParams>,
    ) -> Result<CallToolResult, McpError> {
        let depth = params.depth.unwrap_or(1).min(3) as usize;
        let max_nodes = params.max_nodes.unwrap_or(50).clamp(1, 500) as usize;
        let direction = match params.direction.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("both") => Direction::Both,
            Some("cites") => Direction::Cites,
            Some("cited_by") | Some("citedby") => Direction::CitedBy,
            Some(other) => {
                return Err(McpError::invalid_params(
                    format!("Unknown direction '{}': expected 'cites', 'cited_by' or 'both'", other),
                    None,
                ))
            }
        };

        let builder = CitationGraphBuilder::from_aggregator(&self.aggregator)
            .with_per_node_limit(self.config.citation_limit)
            .with_hydration(params.include_metadata.unwrap_or(false));
        let graph = builder
            .build_from_raw(&params.seeds, depth, direction, max_nodes)
            .await
            .map_err(to_mcp_error)?;
        json_result(&graph)
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn to_mcp_error(err: SourceError) -> McpError {
    match err {
        SourceError::InvalidIdentifier(msg) => McpError::invalid_params(msg, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

#[tool_handler]
impl ServerHandler for ScholarGraphServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Federated scholarly search and citation graphs over arXiv, PubMed, \
                 Semantic Scholar and Google Scholar. Results are deduplicated across \
                 sources; failing sources are reported instead of failing the request."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting scholar-graph MCP server");

    let server = ScholarGraphServer::create()?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
