use std::{path::PathBuf, sync::Arc};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    deletion::DeleteOutcome,
    doc_id::short_id,
    error,
    service::DocService,
};

#[derive(Clone)]
pub struct DocubotMcpServer {
    service: Arc<DocService>,
    tool_router: ToolRouter<Self>,
}

impl DocubotMcpServer {
    pub fn new(service: Arc<DocService>) -> Self {
        Self {
            service,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl DocubotMcpServer {
    /// Upload a local file and index it for question answering.
    #[tool(
        name = "docubot_ingest",
        description = "Upload a local text or markdown file so questions can be answered from it. Returns the new document id."
    )]
    pub async fn docubot_ingest(
        &self,
        params: Parameters<IngestParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let path = params.0.path;
        let report = match self.service.ingest_path(&path).await {
            Ok(report) => report,
            Err(e) => return Ok(tool_failure(&e)),
        };

        let summary = format!(
            "Ingested {} as {} ({} chunks)",
            report.filename, report.id, report.chunk_count
        );
        structured(summary, &report)
    }

    /// List uploaded documents.
    #[tool(
        name = "docubot_list",
        description = "List every uploaded document with its id, filename and status."
    )]
    pub async fn docubot_list(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let records = self
            .service
            .list()
            .await
            .map_err(|e| mcp_error("failed to list documents", e))?;

        let summary = if records.is_empty() {
            "No documents uploaded.".to_string()
        } else {
            records
                .iter()
                .map(|r| {
                    format!("#{} {} [{}]", short_id(&r.id), r.filename, r.status)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        structured(
            summary,
            &json!({ "count": records.len(), "documents": records }),
        )
    }

    /// Delete one document and its indexed chunks.
    #[tool(
        name = "docubot_delete",
        description = "Delete an uploaded document by id, removing it from future answers."
    )]
    pub async fn docubot_delete(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let outcome = self
            .service
            .delete(&params.0.id)
            .await
            .map_err(|e| mcp_error("failed to delete document", e))?;

        let mut result = structured(outcome.message(), &outcome)?;
        if let DeleteOutcome::NotFound { .. } = outcome {
            result.is_error = Some(true);
        }
        Ok(result)
    }

    /// Remove every document.
    #[tool(
        name = "docubot_reset",
        description = "Delete every uploaded document and all indexed content."
    )]
    pub async fn docubot_reset(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let report = self
            .service
            .reset()
            .await
            .map_err(|e| mcp_error("failed to reset", e))?;
        let summary = format!(
            "Removed {} documents and {} chunks",
            report.documents_removed, report.chunks_removed
        );
        structured(summary, &report)
    }

    /// Ask a question answered from the uploaded documents.
    #[tool(
        name = "docubot_chat",
        description = "Ask a question. The answer is grounded in the uploaded documents and lists its source files."
    )]
    pub async fn docubot_chat(
        &self,
        params: Parameters<ChatParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let answer = match self
            .service
            .chat(&params.query, params.session_id.as_deref())
            .await
        {
            Ok(answer) => answer,
            Err(e) => return Ok(tool_failure(&e)),
        };

        let mut summary = answer.answer.clone();
        if !answer.sources.is_empty() {
            summary.push_str(&format!("\n\nSources: {}", answer.sources.join(", ")));
        }
        structured(summary, &answer)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for DocubotMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(
                Implementation::new("docubot", env!("CARGO_PKG_VERSION"))
                    .with_title("docubot MCP"),
            )
            .with_instructions(
                "Use docubot_ingest to upload files, then docubot_chat to ask questions about them. Pass the same sessionId to keep topic tracking per conversation.",
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngestParams {
    /// Path of the file to upload.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    /// Document id returned by docubot_ingest or docubot_list.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatParams {
    /// The question to answer.
    pub query: String,
    /// Conversation id for topic tracking (default: "default").
    pub session_id: Option<String>,
}

fn structured(
    summary: String,
    value: &impl Serialize,
) -> Result<CallToolResult, rmcp::ErrorData> {
    let structured = serde_json::to_value(value)
        .map_err(|e| mcp_error("failed to serialize result", e))?;
    let mut result = CallToolResult::success(vec![Content::text(summary)]);
    result.structured_content = Some(structured);
    Ok(result)
}

/// Failures the caller can act on (bad input, missing file, upstream
/// outage) are reported as tool errors rather than protocol errors.
fn tool_failure(error: &error::Error) -> CallToolResult {
    let mut result = CallToolResult::error(vec![Content::text(error.to_string())]);
    result.structured_content = Some(json!({
        "error": error.to_string(),
        "retryable": error.is_retryable(),
    }));
    result
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub async fn run_mcp(service: Arc<DocService>) -> error::Result<()> {
    let server = DocubotMcpServer::new(service);

    let transport = rmcp::transport::stdio();
    let running = server.serve(transport).await.map_err(|e| {
        error::Error::Config(format!("MCP server initialization failed: {e}"))
    })?;
    running
        .waiting()
        .await
        .map_err(|e| error::Error::Config(format!("MCP server error: {e}")))?;
    Ok(())
}
