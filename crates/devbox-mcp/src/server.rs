//! DevboxServer - MCP server over the tool registry.
//!
//! Implements `ServerHandler` manually: the tool list is read from the
//! registry and every call goes through [`ToolRegistry::invoke_with_timeout`].

use crate::lifecycle::{Lifecycle, ShutdownReason};
use crate::tools::{ContentBlock, ToolOutput, ToolRegistry};
use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData, ServiceExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// MCP server for Devbox instances and code tools.
#[derive(Clone)]
pub struct DevboxServer {
    registry: Arc<ToolRegistry>,
    request_timeout: Duration,
}

impl DevboxServer {
    pub fn new(registry: Arc<ToolRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    /// Tools advertised to clients, in registration order.
    pub fn tools(&self) -> Vec<Tool> {
        self.registry
            .specs()
            .map(|spec| Tool::new(spec.name, spec.description, Arc::clone(&spec.input_schema)))
            .collect()
    }

    /// Run a tool and shape its outcome as an MCP result.
    pub async fn call(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        let params = arguments.map(Value::Object).unwrap_or(Value::Null);
        match self
            .registry
            .invoke_with_timeout(name, params, self.request_timeout)
            .await
        {
            Ok(output) => CallToolResult::success(to_content(output)),
            Err(e) => Self::error_result(e.to_string()),
        }
    }

    /// Helper to create error result
    fn error_result(message: impl Into<String>) -> CallToolResult {
        CallToolResult::error(vec![Content::text(message.into())])
    }
}

/// Map tool output to MCP content. Code blocks are fenced and structured
/// results pretty-printed.
fn to_content(output: ToolOutput) -> Vec<Content> {
    match output {
        ToolOutput::Content(blocks) => blocks
            .into_iter()
            .map(|block| match block {
                ContentBlock::Text { text } => Content::text(text),
                ContentBlock::Code { language, code } => Content::text(format!(
                    "```{}\n{}\n```",
                    language.unwrap_or_default(),
                    code
                )),
            })
            .collect(),
        ToolOutput::Json(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            vec![Content::text(text)]
        }
    }
}

impl ServerHandler for DevboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Devbox MCP Server - Create and manage containerized development instances. \
                 Use create_instance to start an editor with a mounted workspace, \
                 exec_instance to run commands in it, and delete_instance when done. \
                 analyze_code, search_code and modify_code work on host paths."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(self.call(request.name.as_ref(), request.arguments).await)
    }
}

/// Serve MCP over a reader/writer pair (stdin/stdout in production).
///
/// Returns when the client closes the pipe, which requests shutdown, or
/// when shutdown is requested elsewhere, which cancels the session and
/// waits for it to close.
pub async fn serve_pipe<R, W>(
    server: DevboxServer,
    reader: R,
    writer: W,
    lifecycle: &Lifecycle,
) -> std::io::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let service = server
        .serve((reader, writer))
        .await
        .map_err(|e| std::io::Error::other(format!("failed to start pipe transport: {e}")))?;

    lifecycle.mark_ready();
    tracing::info!("Server ready (pipe)");

    let cancel = service.cancellation_token();
    let waiting = service.waiting();
    tokio::pin!(waiting);

    tokio::select! {
        result = &mut waiting => {
            result.map_err(std::io::Error::other)?;
            tracing::info!("Client closed the pipe");
            lifecycle.request_shutdown(ShutdownReason::Requested);
        }
        () = lifecycle.wait_for_shutdown() => {
            tracing::info!("Pipe transport shutting down");
            cancel.cancel();
            match waiting.await {
                Ok(reason) => tracing::debug!(?reason, "Pipe session closed"),
                Err(e) => tracing::warn!(error = %e, "Pipe session did not close cleanly"),
            }
        }
    }
    Ok(())
}
