//! MCP tool discovery.
//!
//! `rmcp`'s client API, used the same way `neuron-mcp` uses it, connects to
//! a remote MCP server, lists its tools, wraps each as a [`ToolInvoker`]
//! namespaced `mcp_{server}_{tool}`, and registers it into the shared
//! [`ToolRegistry`].

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent, Tool as McpTool};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::ServiceExt;

use crate::zerg::error::ZergError;
use crate::zerg::tool_protocol::ToolMetadata;
use crate::zerg::tool_registry::{ToolContext, ToolEnvelope, ToolErrorType, ToolInvoker, ToolRegistry};

/// A running connection to one remote MCP server.
pub struct McpClient {
    server_name: String,
    service: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// Connect by spawning a child process speaking MCP over stdio.
    pub async fn connect_stdio(server_name: impl Into<String>, command: tokio::process::Command) -> Result<Self, ZergError> {
        let transport =
            TokioChildProcess::new(command).map_err(|e| ZergError::upstream(format!("mcp spawn failed: {e}")))?;
        let service = ().serve(transport).await.map_err(|e| ZergError::upstream(format!("mcp handshake failed: {e}")))?;
        Ok(Self { server_name: server_name.into(), service })
    }

    /// Connect to an MCP server exposed over streamable HTTP.
    pub async fn connect_http(server_name: impl Into<String>, url: &str) -> Result<Self, ZergError> {
        let transport = StreamableHttpClientTransport::from_uri(url);
        let service = ().serve(transport).await.map_err(|e| ZergError::upstream(format!("mcp handshake failed: {e}")))?;
        Ok(Self { server_name: server_name.into(), service })
    }

    /// Discover this server's tools and register each as
    /// `mcp_{server_name}_{tool_name}` in `registry`.
    pub async fn discover_and_register(&self, registry: &mut ToolRegistry) -> Result<usize, ZergError> {
        let tools = self
            .service
            .list_all_tools()
            .await
            .map_err(|e| ZergError::upstream(format!("mcp tool listing failed: {e}")))?;

        let peer = Arc::new(self.service.peer().clone());
        let count = tools.len();
        for tool in tools {
            let namespaced_name = format!("mcp_{}_{}", self.server_name, tool.name);
            let metadata = mcp_tool_metadata(&namespaced_name, &tool);
            let invoker = Arc::new(McpToolInvoker { remote_name: tool.name.to_string(), peer: peer.clone() });
            registry.register(metadata, invoker);
        }
        Ok(count)
    }

    pub async fn close(self) -> Result<(), ZergError> {
        self.service.cancel().await.map_err(|e| ZergError::upstream(format!("mcp shutdown failed: {e}")))?;
        Ok(())
    }
}

fn mcp_tool_metadata(namespaced_name: &str, tool: &McpTool) -> ToolMetadata {
    let mut metadata = ToolMetadata::new(namespaced_name, tool.description.as_deref().unwrap_or(""));
    let schema = serde_json::to_value(&*tool.input_schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    metadata.protocol_metadata.insert("input_schema".to_string(), schema);
    metadata
}

struct McpToolInvoker {
    remote_name: String,
    peer: Arc<Peer<RoleClient>>,
}

#[async_trait]
impl ToolInvoker for McpToolInvoker {
    async fn invoke(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
        let params = CallToolRequestParams {
            meta: None,
            name: self.remote_name.clone().into(),
            arguments: args.as_object().cloned(),
            task: None,
        };

        let result: CallToolResult = match self.peer.call_tool(params).await {
            Ok(result) => result,
            Err(e) => return ToolEnvelope::error(ToolErrorType::UpstreamError, e.to_string()),
        };

        if result.is_error == Some(true) {
            return ToolEnvelope::error(ToolErrorType::UpstreamError, extract_text(&result.content));
        }
        if let Some(structured) = result.structured_content {
            return ToolEnvelope::success(structured);
        }
        ToolEnvelope::success(serde_json::Value::String(extract_text(&result.content)))
    }
}

fn extract_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn make_tool(name: &str, description: &str) -> McpTool {
        let schema = serde_json::json!({"type": "object"});
        McpTool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(description.to_string())),
            input_schema: Arc::new(schema.as_object().unwrap().clone()),
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        }
    }

    #[test]
    fn namespaces_remote_tool_name() {
        let tool = make_tool("search", "Searches the web");
        let metadata = mcp_tool_metadata("mcp_brave_search", &tool);
        assert_eq!(metadata.name, "mcp_brave_search");
        assert_eq!(metadata.description, "Searches the web");
        assert!(metadata.protocol_metadata.contains_key("input_schema"));
    }
}
