//! Entity types shared by every subsystem.
//!
//! These are plain, serde-round-trippable structs and enums, not an ORM
//! model: there is no migrations layer in this crate (see
//! [`crate::zerg::store`]), so invariants are documented here but enforced by
//! the subsystem that owns the relevant transition, not by the type itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type OwnerId = Uuid;
pub type AgentId = Uuid;
pub type ThreadId = Uuid;
pub type RunId = Uuid;
pub type TriggerId = Uuid;
pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Uniquely identifies a user. Every agent, credential, thread, and trigger
/// is owner-scoped; there is no cross-owner sharing (see spec Non-goals).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub email: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
}

/// Mutable agent definition. At most one run of an agent may be `running`
/// at any instant; the scheduler and runner enforce this via
/// [`crate::zerg::scheduler::lock::RunLock`], not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub owner_id: OwnerId,
    pub name: String,
    pub model: String,
    pub system_instructions: String,
    pub task_instructions: String,
    /// Glob patterns (e.g. `github_*`) matched against tool names at
    /// invocation time by [`crate::zerg::tool_registry`].
    pub allowed_tools: Vec<String>,
    pub cron_schedule: Option<String>,
    pub status: AgentStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Chat,
    Scheduled,
    Manual,
}

/// An ordered, append-only conversation bound to one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub owner_id: OwnerId,
    pub agent_id: AgentId,
    pub title: String,
    pub kind: ThreadKind,
    /// Opaque to the runner; interpreted only by the active memory strategy.
    pub agent_state: serde_json::Value,
    pub memory_strategy: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool-invocation request attached to an assistant [`Message`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single turn in a [`Thread`]. Tool messages always reference a
/// preceding assistant `tool_calls` entry in the same thread via
/// `tool_call_id`; ordering is total per thread via `sent_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: ThreadId,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub sent_at: DateTime<Utc>,
    /// Groups tool messages to the assistant call that spawned them.
    pub parent_message_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Api,
    Webhook,
    Email,
}

/// One execution of an agent or workflow. Terminal statuses are immutable;
/// `total_tokens`/`total_cost_usd` are only written on the transition into a
/// terminal status, enforced by the runner/engine, not by this struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub owner_id: OwnerId,
    pub agent_id: Option<AgentId>,
    pub workflow_id: Option<WorkflowId>,
    pub thread_id: Option<ThreadId>,
    pub status: RunStatus,
    pub trigger_source: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub total_tokens: Option<u64>,
    /// `None` when the pricing catalog has no entry for the model used.
    pub total_cost_usd: Option<f64>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl Run {
    pub fn queued(id: RunId, owner_id: OwnerId, trigger_source: TriggerSource, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            agent_id: None,
            workflow_id: None,
            thread_id: None,
            status: RunStatus::Queued,
            trigger_source,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            total_tokens: None,
            total_cost_usd: None,
            summary: None,
            error: None,
        }
    }
}

/// Owner-scoped external integration needing bespoke OAuth/webhook plumbing
/// (e.g. a Gmail watch). Uniquely keyed by `(owner_id, connector_type, provider)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connector {
    pub owner_id: OwnerId,
    pub connector_type: String,
    pub provider: String,
    /// Encrypted with the process-wide Fernet key; see [`crate::zerg::credential`].
    pub encrypted_credential: Vec<u8>,
    /// Provider-specific state (Gmail `history_id`, `watch_expiry`, ...).
    pub config: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialTestStatus {
    Untested,
    Success,
    Failed,
}

/// Owner-scoped secret for a built-in tool, uniquely keyed by
/// `(owner_id, connector_type)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountCredential {
    pub owner_id: OwnerId,
    pub connector_type: String,
    pub encrypted_value: Vec<u8>,
    pub display_name: String,
    pub test_status: CredentialTestStatus,
    pub discovery_metadata: Option<serde_json::Value>,
}

/// Optional per-agent override of an [`AccountCredential`], same shape,
/// consulted first by [`crate::zerg::credential::CredentialResolver`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentCredentialOverride {
    pub agent_id: AgentId,
    pub connector_type: String,
    pub encrypted_value: Vec<u8>,
    pub display_name: String,
    pub test_status: CredentialTestStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Email,
}

/// Binds an agent to a wake condition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub owner_id: OwnerId,
    pub agent_id: AgentId,
    pub trigger_type: TriggerType,
    /// Unique per-trigger HMAC key for webhook signature verification.
    pub secret: String,
    pub config: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Agent,
    Tool,
    Conditional,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeLayout {
    pub x: f64,
    pub y: f64,
}

/// Typed per-node configuration. Kept as a tagged enum, never a stringly
/// typed JSON blob, so the engine can exhaustively match on node kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeConfig {
    Trigger { trigger_id: TriggerId },
    Agent { agent_id: AgentId, input_template: Option<String> },
    Tool { tool_name: String, arguments_template: serde_json::Value },
    Conditional { expression: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub config: NodeConfig,
    pub layout: NodeLayout,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// For conditional source nodes: which branch this edge represents.
    pub branch: Option<String>,
}

/// A named graph of [`Node`]s and [`Edge`]s owned by a user. Must be a DAG
/// once conditional branches are resolved; validated at compile time by
/// [`crate::zerg::workflow::engine`], not enforced by this struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub owner_id: OwnerId,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodePhase {
    /// `pending -> running -> {succeeded|failed|skipped}` only.
    pub fn can_transition_to(self, next: NodePhase) -> bool {
        matches!(
            (self, next),
            (NodePhase::Pending, NodePhase::Running)
                | (NodePhase::Pending, NodePhase::Skipped)
                | (NodePhase::Running, NodePhase::Succeeded)
                | (NodePhase::Running, NodePhase::Failed)
        )
    }
}

/// The value a node produced plus metadata, referenced by downstream nodes
/// via the `${N}` / `${N.value}` / `${N.meta.K}` variable grammar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputEnvelope {
    pub value: serde_json::Value,
    pub meta: HashMap<String, serde_json::Value>,
}

/// Per (run, node) execution record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub phase: NodePhase,
    pub output: Option<OutputEnvelope>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
