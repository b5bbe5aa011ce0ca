//! Generalized tool registry and invocation contract.
//!
//! A name -> protocol routing map, built up at startup and treated as
//! immutable thereafter, generalized to the contract this crate needs:
//! `invoke(tool_name, args, ctx) -> envelope`, plus glob-based allowlist
//! matching per agent.

use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{AgentId, OwnerId};
use crate::zerg::error::ZergError;
use crate::zerg::tool_protocol::ToolMetadata;

/// `error_type` values a failed [`ToolEnvelope`] may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorType {
    ConnectorNotConfigured,
    InvalidCredentials,
    RateLimited,
    PermissionDenied,
    UpstreamError,
    InvalidArguments,
}

/// The envelope every tool invocation returns, success or failure. Tool
/// failures never surface as a Rust `Err`/[`ZergError`], they are handed
/// back to the model as structured data, exactly as produced here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolEnvelope {
    Success { ok: SuccessMarker, data: serde_json::Value },
    Error {
        ok: FailureMarker,
        error_type: ToolErrorType,
        user_message: String,
        connector: Option<String>,
        setup_url: Option<String>,
    },
}

/// Serializes to the JSON literal `true`, for the `{ok: true, ...}` envelope shape.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(try_from = "bool", into = "bool")]
pub struct SuccessMarker;
impl TryFrom<bool> for SuccessMarker {
    type Error = &'static str;
    fn try_from(value: bool) -> Result<Self, Self::Error> {
        if value { Ok(SuccessMarker) } else { Err("expected true") }
    }
}
impl From<SuccessMarker> for bool {
    fn from(_: SuccessMarker) -> bool { true }
}

/// Serializes to the JSON literal `false`, matching `{ok: false, ...}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(try_from = "bool", into = "bool")]
pub struct FailureMarker;
impl TryFrom<bool> for FailureMarker {
    type Error = &'static str;
    fn try_from(value: bool) -> Result<Self, Self::Error> {
        if !value { Ok(FailureMarker) } else { Err("expected false") }
    }
}
impl From<FailureMarker> for bool {
    fn from(_: FailureMarker) -> bool { false }
}

impl ToolEnvelope {
    pub fn success(data: serde_json::Value) -> Self {
        ToolEnvelope::Success { ok: SuccessMarker, data }
    }

    pub fn error(error_type: ToolErrorType, user_message: impl Into<String>) -> Self {
        ToolEnvelope::Error {
            ok: FailureMarker,
            error_type,
            user_message: user_message.into(),
            connector: None,
            setup_url: None,
        }
    }

    pub fn with_connector(mut self, connector: impl Into<String>) -> Self {
        if let ToolEnvelope::Error { connector: c, .. } = &mut self {
            *c = Some(connector.into());
        }
        self
    }
}

/// Per-invocation context: the active owner, the agent (if any), and the
/// credential resolver bound to this request.
pub struct ToolContext {
    pub owner_id: OwnerId,
    pub agent_id: Option<AgentId>,
    pub credentials: Arc<CredentialResolver>,
}

/// A registered tool: its metadata plus the invoker that executes it.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, args: serde_json::Value, ctx: &ToolContext) -> ToolEnvelope;
}

struct RegisteredTool {
    metadata: ToolMetadata,
    invoker: Arc<dyn ToolInvoker>,
}

/// Immutable (after startup) map of tool name -> invoker, composed from
/// built-in tools and MCP-discovered tools (namespaced `mcp_{server}_{tool}`).
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool at startup. Not exposed after the registry is handed
    /// to runners, by convention: build the full registry, then share it
    /// behind `Arc`.
    pub fn register(&mut self, metadata: ToolMetadata, invoker: Arc<dyn ToolInvoker>) {
        self.tools.insert(metadata.name.clone(), RegisteredTool { metadata, invoker });
    }

    pub fn metadata(&self, tool_name: &str) -> Option<&ToolMetadata> {
        self.tools.get(tool_name).map(|t| &t.metadata)
    }

    pub fn all_metadata(&self) -> Vec<ToolMetadata> {
        self.tools.values().map(|t| t.metadata.clone()).collect()
    }

    /// Tools visible to an agent, filtered by its glob allowlist (e.g. `github_*`).
    pub fn visible_to(&self, allowed_patterns: &[String]) -> Vec<ToolMetadata> {
        let patterns: Vec<Pattern> = allowed_patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect();
        self.tools
            .values()
            .filter(|t| patterns.iter().any(|p| p.matches(&t.metadata.name)))
            .map(|t| t.metadata.clone())
            .collect()
    }

    fn is_allowed(allowed_patterns: &[String], tool_name: &str) -> bool {
        allowed_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|p| p.matches(tool_name))
    }

    /// Invoke a tool by name, enforcing the agent's glob allowlist first.
    pub async fn invoke(
        &self,
        tool_name: &str,
        allowed_patterns: &[String],
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolEnvelope, ZergError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ZergError::validation(format!("unknown tool: {tool_name}")))?;

        if !Self::is_allowed(allowed_patterns, tool_name) {
            return Err(ZergError::auth(format!("tool {tool_name} is not in the agent's allowlist")));
        }

        Ok(tool.invoker.invoke(args, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::store::InMemoryStore;
    use fernet::Fernet;
    use uuid::Uuid;

    struct EchoInvoker;

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        async fn invoke(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
            ToolEnvelope::success(args)
        }
    }

    fn test_ctx() -> ToolContext {
        let store = Arc::new(InMemoryStore::new());
        let cipher = Arc::new(crate::zerg::credential::CredentialCipher::new(&Fernet::generate_key()).unwrap());
        ToolContext {
            owner_id: Uuid::new_v4(),
            agent_id: None,
            credentials: Arc::new(CredentialResolver::new(None, Uuid::new_v4(), store, cipher)),
        }
    }

    #[tokio::test]
    async fn invoke_rejects_tool_outside_glob_allowlist() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolMetadata::new("github_create_issue", "create an issue"), Arc::new(EchoInvoker));

        let ctx = test_ctx();
        let result = registry
            .invoke("github_create_issue", &["slack_*".to_string()], serde_json::json!({}), &ctx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invoke_succeeds_when_glob_matches() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolMetadata::new("github_create_issue", "create an issue"), Arc::new(EchoInvoker));

        let ctx = test_ctx();
        let envelope = registry
            .invoke("github_create_issue", &["github_*".to_string()], serde_json::json!({"x": 1}), &ctx)
            .await
            .unwrap();
        assert!(matches!(envelope, ToolEnvelope::Success { .. }));
    }

    #[test]
    fn envelope_serializes_to_ok_true_shape() {
        let envelope = ToolEnvelope::success(serde_json::json!({"n": 1}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
        assert_eq!(value["data"]["n"], serde_json::json!(1));
    }

    #[test]
    fn error_envelope_carries_error_type() {
        let envelope = ToolEnvelope::error(ToolErrorType::ConnectorNotConfigured, "no github credential")
            .with_connector("github");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["ok"], serde_json::json!(false));
        assert_eq!(value["error_type"], serde_json::json!("connector_not_configured"));
        assert_eq!(value["connector"], serde_json::json!("github"));
    }
}
