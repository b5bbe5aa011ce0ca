//! End-to-end: the model requests three tool calls in one turn, one of
//! which fails with a `rate_limited` envelope. All three results come back
//! as tool messages and the loop continues to a second, tool-call-free turn.

use std::sync::Arc;

use async_trait::async_trait;
use fernet::Fernet;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use zerg_core::zerg::agent_runner::{run_turn, AgentRunnerDeps};
use zerg_core::zerg::client_wrapper::{ClientWrapper, Message as WireMessage, NativeToolCall, Role as WireRole, TokenUsage, ToolDefinition};
use zerg_core::zerg::credential::{CredentialCipher, CredentialResolver};
use zerg_core::zerg::domain::{Agent, AgentStatus, MessageRole, Run, RunStatus, TriggerSource};
use zerg_core::zerg::event::EventBus;
use zerg_core::zerg::pricing::StaticPricingCatalog;
use zerg_core::zerg::store::{InMemoryStore, Store};
use zerg_core::zerg::tool_protocol::ToolMetadata;
use zerg_core::zerg::tool_registry::{ToolContext, ToolEnvelope, ToolErrorType, ToolInvoker, ToolRegistry};

struct OkInvoker;

#[async_trait]
impl ToolInvoker for OkInvoker {
    async fn invoke(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
        ToolEnvelope::success(args)
    }
}

struct RateLimitedInvoker;

#[async_trait]
impl ToolInvoker for RateLimitedInvoker {
    async fn invoke(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
        ToolEnvelope::error(ToolErrorType::RateLimited, "too many requests, retry later")
    }
}

struct ScriptedClient {
    replies: TokioMutex<Vec<WireMessage>>,
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn send_message(
        &self,
        _messages: &[WireMessage],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<WireMessage, Box<dyn std::error::Error>> {
        let mut replies = self.replies.lock().await;
        if replies.is_empty() {
            return Ok(WireMessage { role: WireRole::Assistant, content: "all done".into(), tool_calls: vec![] });
        }
        Ok(replies.remove(0))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        Some(TokenUsage { input_tokens: 8, output_tokens: 3, total_tokens: 11 })
    }
}

#[tokio::test]
async fn one_rate_limited_call_does_not_block_the_other_two_or_the_next_turn() {
    let mut tool_registry = ToolRegistry::new();
    tool_registry.register(ToolMetadata::new("search_a", "search provider a"), Arc::new(OkInvoker));
    tool_registry.register(ToolMetadata::new("search_b", "search provider b"), Arc::new(OkInvoker));
    tool_registry.register(ToolMetadata::new("search_c", "search provider c"), Arc::new(RateLimitedInvoker));

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let deps = AgentRunnerDeps {
        store: store.clone(),
        event_bus: Arc::new(EventBus::new()),
        tool_registry: Arc::new(tool_registry),
        pricing: Arc::new(StaticPricingCatalog::empty()),
    };

    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        name: "fanout".into(),
        model: "mock-model".into(),
        system_instructions: "Be helpful.".into(),
        task_instructions: "Search all three providers.".into(),
        allowed_tools: vec!["search_*".to_string()],
        cron_schedule: None,
        status: AgentStatus::Idle,
    };

    let first_turn = WireMessage {
        role: WireRole::Assistant,
        content: String::new().into(),
        tool_calls: vec![
            NativeToolCall { id: "call-a".into(), name: "search_a".into(), arguments: serde_json::json!({"q": "a"}) },
            NativeToolCall { id: "call-b".into(), name: "search_b".into(), arguments: serde_json::json!({"q": "b"}) },
            NativeToolCall { id: "call-c".into(), name: "search_c".into(), arguments: serde_json::json!({"q": "c"}) },
        ],
    };
    let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient { replies: TokioMutex::new(vec![first_turn]) });

    let cipher = Arc::new(CredentialCipher::new(&Fernet::generate_key()).unwrap());
    let credentials = Arc::new(CredentialResolver::new(Some(agent.id), agent.owner_id, store.clone(), cipher));
    let thread_id = Uuid::new_v4();
    let run = Run::queued(Uuid::new_v4(), agent.owner_id, TriggerSource::Manual, chrono::Utc::now());

    let outcome = run_turn(&deps, &agent, thread_id, client, credentials, serde_json::json!({}), run).await.unwrap();

    assert_eq!(outcome.run.status, RunStatus::Success);

    let tool_messages: Vec<_> = outcome.new_messages.iter().filter(|m| m.role == MessageRole::Tool).collect();
    assert_eq!(tool_messages.len(), 3);

    let by_call_id = |id: &str| tool_messages.iter().find(|m| m.tool_call_id.as_deref() == Some(id)).unwrap();

    let ok_a: serde_json::Value = serde_json::from_str(&by_call_id("call-a").content).unwrap();
    assert_eq!(ok_a["ok"], serde_json::json!(true));

    let ok_b: serde_json::Value = serde_json::from_str(&by_call_id("call-b").content).unwrap();
    assert_eq!(ok_b["ok"], serde_json::json!(true));

    let failed_c: serde_json::Value = serde_json::from_str(&by_call_id("call-c").content).unwrap();
    assert_eq!(failed_c["ok"], serde_json::json!(false));
    assert_eq!(failed_c["error_type"], serde_json::json!("rate_limited"));

    let final_assistant = outcome.new_messages.iter().filter(|m| m.role == MessageRole::Assistant).last().unwrap();
    assert_eq!(final_assistant.content, "all done");

    let persisted = store.load_thread_messages(thread_id).await.unwrap();
    assert_eq!(persisted.len(), outcome.new_messages.len());
}
