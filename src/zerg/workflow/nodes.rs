//! Per-node-type executors.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::zerg::agent_runner::{self, AgentRunnerDeps};
use crate::zerg::client_wrapper::ClientWrapper;
use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{
    Agent, AgentId, Message as DomainMessage, MessageRole, NodeConfig, OutputEnvelope, OwnerId, Run,
    RunId, ThreadId, TriggerSource,
};
use crate::zerg::error::ZergError;
use crate::zerg::expression;
use crate::zerg::tool_registry::{ToolContext, ToolEnvelope};
use crate::zerg::workflow::state::{resolve_variables, WorkflowState};

/// Everything a node executor needs that the engine itself doesn't track.
pub struct NodeExecCtx<'a> {
    pub run_id: RunId,
    pub owner_id: OwnerId,
    pub trigger_payload: &'a serde_json::Value,
    pub agent_runner_deps: &'a AgentRunnerDeps,
    pub credentials: Arc<CredentialResolver>,
    pub tool_ctx: &'a ToolContext,
    /// Glob patterns gating which tools a Tool node may invoke; distinct from
    /// an Agent node's own `allowed_tools`, which come off the loaded `Agent`.
    pub tool_allowed_patterns: &'a [String],
    pub load_agent: &'a (dyn Fn(AgentId) -> Option<Agent> + Sync),
    pub resolve_client: &'a (dyn Fn(&str) -> Arc<dyn ClientWrapper> + Sync),
}

/// Outcome of executing a single node: its envelope, or a node-local failure.
pub enum NodeOutcome {
    Succeeded(OutputEnvelope),
    Failed(String),
}

pub async fn execute_node(config: &NodeConfig, state: &WorkflowState, ctx: &NodeExecCtx<'_>) -> NodeOutcome {
    let started_at = Utc::now();
    let result = match config {
        NodeConfig::Trigger { .. } => Ok(trigger_envelope(ctx, started_at)),
        NodeConfig::Tool { tool_name, arguments_template } => {
            execute_tool(tool_name, arguments_template, state, ctx, started_at).await
        }
        NodeConfig::Agent { agent_id, input_template } => {
            execute_agent(*agent_id, input_template.as_deref(), state, ctx, started_at).await
        }
        NodeConfig::Conditional { expression: expr } => execute_conditional(expr, state, started_at),
    };

    match result {
        Ok(envelope) => NodeOutcome::Succeeded(envelope),
        Err(e) => NodeOutcome::Failed(e.to_string()),
    }
}

fn envelope_meta(node_type: &str, started_at: chrono::DateTime<Utc>) -> HashMap<String, serde_json::Value> {
    let finished_at = Utc::now();
    let mut meta = HashMap::new();
    meta.insert("node_type".to_string(), serde_json::json!(node_type));
    meta.insert("started_at".to_string(), serde_json::json!(started_at.to_rfc3339()));
    meta.insert("finished_at".to_string(), serde_json::json!(finished_at.to_rfc3339()));
    meta.insert(
        "duration_ms".to_string(),
        serde_json::json!((finished_at - started_at).num_milliseconds().max(0)),
    );
    meta
}

fn trigger_envelope(ctx: &NodeExecCtx<'_>, started_at: chrono::DateTime<Utc>) -> OutputEnvelope {
    OutputEnvelope { value: ctx.trigger_payload.clone(), meta: envelope_meta("trigger", started_at) }
}

async fn execute_tool(
    tool_name: &str,
    arguments_template: &serde_json::Value,
    state: &WorkflowState,
    ctx: &NodeExecCtx<'_>,
    started_at: chrono::DateTime<Utc>,
) -> Result<OutputEnvelope, ZergError> {
    let args = resolve_variables(arguments_template, state)?;
    let envelope = ctx
        .agent_runner_deps
        .tool_registry
        .invoke(tool_name, ctx.tool_allowed_patterns, args, ctx.tool_ctx)
        .await?;

    let mut meta = envelope_meta("tool", started_at);
    meta.insert("tool_name".to_string(), serde_json::json!(tool_name));

    match envelope {
        ToolEnvelope::Success { data, .. } => Ok(OutputEnvelope { value: data, meta }),
        ToolEnvelope::Error { user_message, .. } => Err(ZergError::upstream(user_message)),
    }
}

async fn execute_agent(
    agent_id: AgentId,
    input_template: Option<&str>,
    state: &WorkflowState,
    ctx: &NodeExecCtx<'_>,
    started_at: chrono::DateTime<Utc>,
) -> Result<OutputEnvelope, ZergError> {
    let agent = (ctx.load_agent)(agent_id).ok_or_else(|| ZergError::validation("unknown agent referenced by node"))?;

    let message_text = match input_template {
        Some(template) => {
            let resolved = resolve_variables(&serde_json::Value::String(template.to_string()), state)?;
            resolved.as_str().unwrap_or_default().to_string()
        }
        None => agent.task_instructions.clone(),
    };

    let thread_id: ThreadId = Uuid::new_v4();
    let user_message = DomainMessage {
        id: Uuid::new_v4(),
        thread_id,
        role: MessageRole::User,
        content: message_text,
        tool_calls: None,
        tool_call_id: None,
        name: None,
        sent_at: Utc::now(),
        parent_message_id: None,
    };
    ctx.agent_runner_deps.store.append_message(user_message).await?;

    let client = (ctx.resolve_client)(&agent.model);
    let run = Run::queued(Uuid::new_v4(), ctx.owner_id, TriggerSource::Api, Utc::now());

    let outcome = agent_runner::run_turn(
        ctx.agent_runner_deps,
        &agent,
        thread_id,
        client,
        ctx.credentials.clone(),
        serde_json::json!({}),
        run,
    )
    .await?;

    let messages: Vec<serde_json::Value> = outcome
        .new_messages
        .iter()
        .map(|m| serde_json::json!({ "role": format!("{:?}", m.role), "content": m.content }))
        .collect();

    let mut meta = envelope_meta("agent", started_at);
    meta.insert("agent_id".to_string(), serde_json::json!(agent_id));
    Ok(OutputEnvelope { value: serde_json::json!({ "messages": messages }), meta })
}

fn execute_conditional(
    expr: &str,
    state: &WorkflowState,
    started_at: chrono::DateTime<Utc>,
) -> Result<OutputEnvelope, ZergError> {
    let mut variables = HashMap::new();
    for (node_id, envelope) in &state.node_outputs {
        variables.insert(node_id.clone(), envelope.value.clone());
    }
    let evaluated = expression::evaluate(expr, &variables)?;
    let meta = envelope_meta("conditional", started_at);
    Ok(OutputEnvelope { value: serde_json::json!(evaluated.as_branch_bool()), meta })
}
