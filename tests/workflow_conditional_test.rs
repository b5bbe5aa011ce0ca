//! End-to-end: trigger -> tool(`http_get`) -> conditional(`http_get == 200`)
//! -> branch-true: agent, branch-false: tool(`notify`). The branch actually
//! taken flips with the mocked tool's returned status code; the other
//! branch's node is recorded as skipped.

use std::sync::Arc;

use async_trait::async_trait;
use fernet::Fernet;
use uuid::Uuid;

use zerg_core::zerg::agent_runner::AgentRunnerDeps;
use zerg_core::zerg::client_wrapper::{ClientWrapper, Message as WireMessage, Role as WireRole, TokenUsage, ToolDefinition};
use zerg_core::zerg::credential::{CredentialCipher, CredentialResolver};
use zerg_core::zerg::domain::{
    Agent, AgentStatus, Edge, Node, NodeConfig, NodeLayout, NodePhase, NodeType, RunStatus, Run, Workflow,
};
use zerg_core::zerg::event::EventBus;
use zerg_core::zerg::pricing::StaticPricingCatalog;
use zerg_core::zerg::store::{InMemoryStore, Store};
use zerg_core::zerg::tool_registry::{ToolContext, ToolEnvelope, ToolInvoker, ToolRegistry};
use zerg_core::zerg::workflow::engine::{compile, execute, new_cancel_flag, ExecutionDeps};
use zerg_core::zerg::workflow::nodes::NodeExecCtx;

struct MockClientWrapper;

#[async_trait]
impl ClientWrapper for MockClientWrapper {
    async fn send_message(
        &self,
        _messages: &[WireMessage],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<WireMessage, Box<dyn std::error::Error>> {
        Ok(WireMessage { role: WireRole::Assistant, content: "done".into(), tool_calls: vec![] })
    }

    fn model_name(&self) -> &str {
        "gpt-4o-mini"
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        Some(TokenUsage { input_tokens: 1, output_tokens: 1, total_tokens: 2 })
    }
}

struct FixedStatusInvoker(i64);

#[async_trait]
impl ToolInvoker for FixedStatusInvoker {
    async fn invoke(&self, _args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
        ToolEnvelope::success(serde_json::json!(self.0))
    }
}

struct NotifyInvoker;

#[async_trait]
impl ToolInvoker for NotifyInvoker {
    async fn invoke(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolEnvelope {
        ToolEnvelope::success(args)
    }
}

fn node(id: &str, node_type: NodeType, config: NodeConfig) -> Node {
    Node { id: id.to_string(), node_type, config, layout: NodeLayout { x: 0.0, y: 0.0 } }
}

fn edge(from: &str, to: &str, branch: Option<&str>) -> Edge {
    Edge { from: from.to_string(), to: to.to_string(), branch: branch.map(|b| b.to_string()) }
}

fn branching_workflow(owner_id: Uuid, trigger_id: Uuid, agent_id: Uuid) -> Workflow {
    Workflow {
        id: Uuid::new_v4(),
        owner_id,
        name: "webhook status branch".into(),
        nodes: vec![
            node("trigger", NodeType::Trigger, NodeConfig::Trigger { trigger_id }),
            node(
                "http_get",
                NodeType::Tool,
                NodeConfig::Tool { tool_name: "http_get".into(), arguments_template: serde_json::json!({}) },
            ),
            node("status_ok", NodeType::Conditional, NodeConfig::Conditional { expression: "http_get == 200".into() }),
            node(
                "respond",
                NodeType::Agent,
                NodeConfig::Agent { agent_id, input_template: None },
            ),
            node(
                "notify",
                NodeType::Tool,
                NodeConfig::Tool { tool_name: "notify".into(), arguments_template: serde_json::json!({"reason": "non-200"}) },
            ),
        ],
        edges: vec![
            edge("trigger", "http_get", None),
            edge("http_get", "status_ok", None),
            edge("status_ok", "respond", Some("true")),
            edge("status_ok", "notify", Some("false")),
        ],
    }
}

async fn run_workflow(status_code: i64, agent: &Agent, owner_id: Uuid, trigger_id: Uuid) -> (RunStatus, Vec<(String, NodePhase)>) {
    let workflow = branching_workflow(owner_id, trigger_id, agent.id);
    let compiled = compile(&workflow).unwrap();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    store.upsert_agent(agent.clone()).await.unwrap();

    let mut tool_registry = ToolRegistry::new();
    tool_registry.register(
        zerg_core::zerg::tool_protocol::ToolMetadata::new("http_get", "fetch a url"),
        Arc::new(FixedStatusInvoker(status_code)),
    );
    tool_registry.register(
        zerg_core::zerg::tool_protocol::ToolMetadata::new("notify", "send a notification"),
        Arc::new(NotifyInvoker),
    );

    let event_bus = EventBus::new();
    let runner_deps = AgentRunnerDeps {
        store: store.clone(),
        event_bus: Arc::new(EventBus::new()),
        tool_registry: Arc::new(tool_registry),
        pricing: Arc::new(StaticPricingCatalog::empty()),
    };

    let cipher = Arc::new(CredentialCipher::new(&Fernet::generate_key()).unwrap());
    let credentials = Arc::new(CredentialResolver::new(Some(agent.id), owner_id, store.clone(), cipher));
    let tool_ctx = ToolContext { owner_id, agent_id: Some(agent.id), credentials: credentials.clone() };
    let trigger_payload = serde_json::json!({});
    let allowed = vec!["http_get".to_string(), "notify".to_string()];

    let agent_for_lookup = agent.clone();
    let load_agent = move |id: Uuid| if id == agent_for_lookup.id { Some(agent_for_lookup.clone()) } else { None };
    let resolve_client = |_model: &str| -> Arc<dyn ClientWrapper> { Arc::new(MockClientWrapper) };

    let ctx_factory = move || NodeExecCtx {
        run_id: Uuid::nil(),
        owner_id,
        trigger_payload: &trigger_payload,
        agent_runner_deps: &runner_deps,
        credentials: credentials.clone(),
        tool_ctx: &tool_ctx,
        tool_allowed_patterns: &allowed,
        load_agent: &load_agent,
        resolve_client: &resolve_client,
    };

    let run = Run::queued(Uuid::new_v4(), owner_id, zerg_core::zerg::domain::TriggerSource::Webhook, chrono::Utc::now());
    let deps = ExecutionDeps { store: store.as_ref(), event_bus: &event_bus, node_ctx_factory: &ctx_factory };
    let cancel = new_cancel_flag();
    let result = execute(&compiled, &run, &deps, &cancel).await.unwrap();

    let states = store.load_node_states(run.id).await.unwrap();
    let phases = states.into_iter().map(|s| (s.node_id, s.phase)).collect();
    (result.status, phases)
}

#[tokio::test]
async fn status_200_takes_the_true_branch_and_skips_notify() {
    let owner_id = Uuid::new_v4();
    let trigger_id = Uuid::new_v4();
    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id,
        name: "responder".into(),
        model: "gpt-4o-mini".into(),
        system_instructions: "Be helpful.".into(),
        task_instructions: "Acknowledge the successful check.".into(),
        allowed_tools: vec![],
        cron_schedule: None,
        status: AgentStatus::Idle,
    };

    let (status, phases) = run_workflow(200, &agent, owner_id, trigger_id).await;
    assert_eq!(status, RunStatus::Success);

    let phase_of = |id: &str| phases.iter().find(|(n, _)| n == id).map(|(_, p)| *p).unwrap();
    assert_eq!(phase_of("respond"), NodePhase::Succeeded);
    assert_eq!(phase_of("notify"), NodePhase::Skipped);
}

#[tokio::test]
async fn status_500_takes_the_false_branch_and_skips_the_agent() {
    let owner_id = Uuid::new_v4();
    let trigger_id = Uuid::new_v4();
    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id,
        name: "responder".into(),
        model: "gpt-4o-mini".into(),
        system_instructions: "Be helpful.".into(),
        task_instructions: "Acknowledge the successful check.".into(),
        allowed_tools: vec![],
        cron_schedule: None,
        status: AgentStatus::Idle,
    };

    let (status, phases) = run_workflow(500, &agent, owner_id, trigger_id).await;
    assert_eq!(status, RunStatus::Success);

    let phase_of = |id: &str| phases.iter().find(|(n, _)| n == id).map(|(_, p)| *p).unwrap();
    assert_eq!(phase_of("notify"), NodePhase::Succeeded);
    assert_eq!(phase_of("respond"), NodePhase::Skipped);
}
