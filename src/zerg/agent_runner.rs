//! Drives one agent turn: prompt assembly, the tool-calling ReAct loop,
//! message persistence, and cost accounting.
//!
//! Grounded in `llm_session.rs` (history management, context trimming) and a
//! ReAct tool loop, generalized here from "one hand-rolled agent session"
//! into a stateless function operating over
//! [`crate::zerg::domain::Thread`]/[`crate::zerg::store::Store`] rather than
//! owning its own session object, so it composes with the workflow engine's
//! agent-type nodes.

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::zerg::client_wrapper::{
    ClientWrapper, Message as WireMessage, NativeToolCall, Role as WireRole, ToolDefinition,
};
use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{
    Agent, Message as DomainMessage, MessageRole, Run, RunStatus, ThreadId, ToolCallRequest,
};
use crate::zerg::error::ZergError;
use crate::zerg::event::{Event, EventBus};
use crate::zerg::pricing::StaticPricingCatalog;
use crate::zerg::store::Store;
use crate::zerg::tool_registry::{ToolContext, ToolEnvelope, ToolRegistry};

const SUMMARY_MAX_CHARS: usize = 500;
const MAX_TOOL_ITERATIONS: usize = 25;

/// Static connector-protocol block prepended to every system message:
/// capability-presentation, error-handling, and temporal-awareness rules.
const CONNECTOR_PROTOCOL_BLOCK: &str = "\
You have access to a fixed set of tools exposed by the active connectors. \
Only call tools that are explicitly offered to you in this turn; never assume a \
capability that was not presented. When a tool call fails, inspect the returned \
error envelope (`error_type`, `user_message`) and decide whether to retry, pick a \
different tool, or explain the failure to the user — do not silently ignore it. \
Treat the `current_time` value in your context injection as authoritative; do not \
reason about dates using training-time assumptions.";

/// Newly produced domain messages plus the updated [`Run`] record.
pub struct RunnerOutcome {
    pub new_messages: Vec<DomainMessage>,
    pub run: Run,
}

pub struct AgentRunnerDeps {
    pub store: Arc<dyn Store>,
    pub event_bus: Arc<EventBus>,
    pub tool_registry: Arc<ToolRegistry>,
    pub pricing: Arc<StaticPricingCatalog>,
}

/// Run one agent turn against `thread_id`. `client` is the already-resolved
/// provider wrapper for `agent.model`; `connector_status` is a pre-captured
/// snapshot (capture happens one level up, where the credential resolver and
/// connector registry both live).
pub async fn run_turn(
    deps: &AgentRunnerDeps,
    agent: &Agent,
    thread_id: ThreadId,
    client: Arc<dyn ClientWrapper>,
    credentials: Arc<CredentialResolver>,
    connector_status: serde_json::Value,
    run: Run,
) -> Result<RunnerOutcome, ZergError> {
    deps.event_bus.publish(Event::RunCreated { run_id: run.id, owner_id: run.owner_id });

    let persisted = deps.store.load_thread_messages(thread_id).await?;
    let suffix_start = persisted.len();

    let system_content = build_system_message(agent, &connector_status);
    let mut working: Vec<WireMessage> = vec![WireMessage {
        role: WireRole::System,
        content: system_content.into(),
        tool_calls: vec![],
    }];
    working.extend(persisted.iter().map(domain_to_wire));

    let tool_defs = build_tool_definitions(deps, &agent.allowed_tools);
    let ctx = ToolContext { owner_id: run.owner_id, agent_id: Some(agent.id), credentials };

    let mut total_input_tokens = 0usize;
    let mut total_output_tokens = 0usize;
    let mut new_domain_messages: Vec<DomainMessage> = Vec::new();

    let run_result: Result<(), ZergError> = async {
        for _ in 0..MAX_TOOL_ITERATIONS {
            let response = client
                .send_message(&working, Some(tool_defs.clone()))
                .await
                .map_err(|e| ZergError::upstream(e.to_string()))?;

            if let Some(usage) = client.get_last_usage().await {
                total_input_tokens += usage.input_tokens;
                total_output_tokens += usage.output_tokens;
            }

            let assistant_domain = wire_to_domain_assistant(thread_id, &response);
            new_domain_messages.push(assistant_domain.clone());
            working.push(response.clone());

            if response.tool_calls.is_empty() {
                break;
            }

            let tool_results = join_all(response.tool_calls.iter().map(|call| {
                let registry = deps.tool_registry.clone();
                let allowed = agent.allowed_tools.clone();
                let ctx = &ctx;
                let call = call.clone();
                async move {
                    let envelope = registry
                        .invoke(&call.name, &allowed, call.arguments.clone(), ctx)
                        .await
                        .unwrap_or_else(|e| {
                            ToolEnvelope::error(
                                crate::zerg::tool_registry::ToolErrorType::InvalidArguments,
                                e.to_string(),
                            )
                        });
                    (call, envelope)
                }
            }))
            .await;

            for (call, envelope) in tool_results {
                let content = serde_json::to_string(&envelope).unwrap_or_default();
                let tool_domain = DomainMessage {
                    id: Uuid::new_v4(),
                    thread_id,
                    role: MessageRole::Tool,
                    content: content.clone(),
                    tool_calls: None,
                    tool_call_id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    sent_at: Utc::now(),
                    parent_message_id: Some(assistant_domain.id),
                };
                new_domain_messages.push(tool_domain);
                working.push(WireMessage {
                    role: WireRole::Tool { call_id: call.id.clone() },
                    content: content.into(),
                    tool_calls: vec![],
                });
            }
        }
        Ok(())
    }
    .await;

    for message in &new_domain_messages {
        deps.store.append_message(message.clone()).await?;
    }

    if let Some(first) = new_domain_messages.iter().find(|m| m.role == MessageRole::Assistant) {
        deps.event_bus.publish(Event::ThreadMessageCreated { thread_id, message_id: first.id });
    }

    let total_tokens = (total_input_tokens + total_output_tokens) as u64;
    let usage = crate::zerg::client_wrapper::TokenUsage {
        input_tokens: total_input_tokens,
        output_tokens: total_output_tokens,
        total_tokens: total_input_tokens + total_output_tokens,
    };
    let total_cost_usd = deps.pricing.cost_usd(&agent.model, &usage);
    let summary = derive_summary(&new_domain_messages);

    let mut final_run = run;
    let finished_at = Utc::now();
    final_run.finished_at = Some(finished_at);
    final_run.duration_ms = Some((finished_at - final_run.started_at).num_milliseconds().max(0) as u64);
    final_run.total_tokens = Some(total_tokens);
    final_run.total_cost_usd = total_cost_usd;
    final_run.summary = summary;

    match run_result {
        Ok(()) => final_run.status = RunStatus::Success,
        Err(e) => {
            final_run.status = RunStatus::Failed;
            final_run.error = Some(e.to_string());
        }
    }

    deps.store.upsert_run(final_run.clone()).await?;
    deps.event_bus.publish(Event::RunUpdated { run_id: final_run.id, status: format!("{:?}", final_run.status) });

    Ok(RunnerOutcome { new_messages: new_domain_messages, run: final_run })
}

fn build_system_message(agent: &Agent, connector_status: &serde_json::Value) -> String {
    let context_injection = json!({
        "current_time": Utc::now().to_rfc3339(),
        "connector_status": connector_status,
        "captured_at": Utc::now().to_rfc3339(),
    });
    format!(
        "{}\n\n{}\n\n[context]\n{}",
        agent.system_instructions,
        CONNECTOR_PROTOCOL_BLOCK,
        context_injection
    )
}

fn build_tool_definitions(deps: &AgentRunnerDeps, allowed_patterns: &[String]) -> Vec<ToolDefinition> {
    deps.tool_registry
        .visible_to(allowed_patterns)
        .into_iter()
        .map(|metadata| ToolDefinition {
            name: metadata.name,
            description: metadata.description,
            parameters_schema: json!({ "type": "object" }),
        })
        .collect()
}

/// Timestamp-prefix user/assistant content for model presentation only;
/// never mutates the persisted record.
fn presentation_content(role: &MessageRole, content: &str, sent_at: chrono::DateTime<Utc>) -> String {
    match role {
        MessageRole::User | MessageRole::Assistant => format!("[{}] {}", sent_at.to_rfc3339(), content),
        MessageRole::System | MessageRole::Tool => content.to_string(),
    }
}

fn domain_to_wire(message: &DomainMessage) -> WireMessage {
    let prefixed = presentation_content(&message.role, &message.content, message.sent_at);
    let role = match &message.role {
        MessageRole::System => WireRole::System,
        MessageRole::User => WireRole::User,
        MessageRole::Assistant => WireRole::Assistant,
        MessageRole::Tool => WireRole::Tool { call_id: message.tool_call_id.clone().unwrap_or_default() },
    };
    let tool_calls = message
        .tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|c| NativeToolCall { id: c.id.clone(), name: c.name.clone(), arguments: c.arguments.clone() })
                .collect()
        })
        .unwrap_or_default();
    WireMessage { role, content: prefixed.into(), tool_calls }
}

fn wire_to_domain_assistant(thread_id: ThreadId, message: &WireMessage) -> DomainMessage {
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|c| ToolCallRequest { id: c.id.clone(), name: c.name.clone(), arguments: c.arguments.clone() })
                .collect(),
        )
    };
    DomainMessage {
        id: Uuid::new_v4(),
        thread_id,
        role: MessageRole::Assistant,
        content: message.content.to_string(),
        tool_calls,
        tool_call_id: None,
        name: None,
        sent_at: Utc::now(),
        parent_message_id: None,
    }
}

fn derive_summary(messages: &[DomainMessage]) -> Option<String> {
    let first_assistant_text = messages.iter().find(|m| m.role == MessageRole::Assistant)?;
    let mut summary = first_assistant_text.content.clone();
    if summary.len() > SUMMARY_MAX_CHARS {
        summary.truncate(SUMMARY_MAX_CHARS);
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::client_wrapper::TokenUsage;
    use crate::zerg::domain::{AgentStatus, TriggerSource};
    use crate::zerg::store::InMemoryStore;
    use async_trait::async_trait;
    use std::error::Error;
    use tokio::sync::Mutex as TokioMutex;

    struct MockClientWrapper {
        replies: TokioMutex<Vec<WireMessage>>,
    }

    #[async_trait]
    impl ClientWrapper for MockClientWrapper {
        async fn send_message(
            &self,
            _messages: &[WireMessage],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<WireMessage, Box<dyn Error>> {
            let mut replies = self.replies.lock().await;
            if replies.is_empty() {
                return Ok(WireMessage { role: WireRole::Assistant, content: "done".into(), tool_calls: vec![] });
            }
            Ok(replies.remove(0))
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }

        async fn get_last_usage(&self) -> Option<TokenUsage> {
            Some(TokenUsage { input_tokens: 10, output_tokens: 5, total_tokens: 15 })
        }
    }

    fn test_agent() -> Agent {
        Agent {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "assistant".into(),
            model: "mock-model".into(),
            system_instructions: "Be helpful.".into(),
            task_instructions: String::new(),
            allowed_tools: vec![],
            cron_schedule: None,
            status: AgentStatus::Idle,
        }
    }

    fn deps() -> AgentRunnerDeps {
        AgentRunnerDeps {
            store: Arc::new(InMemoryStore::new()),
            event_bus: Arc::new(EventBus::new()),
            tool_registry: Arc::new(ToolRegistry::new()),
            pricing: Arc::new(StaticPricingCatalog::empty()),
        }
    }

    #[tokio::test]
    async fn turn_with_no_tool_calls_persists_one_assistant_message() {
        let deps = deps();
        let agent = test_agent();
        let thread_id = Uuid::new_v4();
        let client: Arc<dyn ClientWrapper> = Arc::new(MockClientWrapper { replies: TokioMutex::new(vec![]) });
        let store = Arc::new(InMemoryStore::new());
        let cipher = Arc::new(crate::zerg::credential::CredentialCipher::new(&fernet::Fernet::generate_key()).unwrap());
        let credentials = Arc::new(CredentialResolver::new(Some(agent.id), agent.owner_id, store, cipher));
        let run = Run::queued(Uuid::new_v4(), agent.owner_id, TriggerSource::Manual, Utc::now());

        let outcome = run_turn(&deps, &agent, thread_id, client, credentials, json!({}), run).await.unwrap();

        assert_eq!(outcome.new_messages.len(), 1);
        assert_eq!(outcome.run.status, RunStatus::Success);
        assert_eq!(outcome.run.total_tokens, Some(15));
    }

    #[test]
    fn summary_truncates_to_five_hundred_chars() {
        let long = "x".repeat(600);
        let messages = vec![DomainMessage {
            id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            role: MessageRole::Assistant,
            content: long,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            sent_at: Utc::now(),
            parent_message_id: None,
        }];
        let summary = derive_summary(&messages).unwrap();
        assert_eq!(summary.len(), SUMMARY_MAX_CHARS);
    }
}
