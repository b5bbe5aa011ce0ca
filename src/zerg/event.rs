//! In-process event bus and WebSocket wire envelope.
//!
//! Generalizes the original single-callback [`EventHandler`] design (one
//! `Arc<dyn EventHandler>` invoked inline by whoever produced the event)
//! into a real publish/subscribe bus: producers call [`EventBus::publish`],
//! and any number of subscribers each get their own
//! [`tokio::sync::broadcast::Receiver`]. Per-subscriber FIFO and
//! at-most-once-per-process delivery fall directly out of
//! `tokio::sync::broadcast`'s guarantees, the same primitive family the
//! crate already depends on via `tokio`'s `full` feature set.
//!
//! Fan-out to WebSocket clients (bounded mailboxes, back-pressure isolation)
//! lives in [`crate::zerg::ws`]; this module only defines the event
//! vocabulary and the bus that carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::zerg::domain::{AgentId, NodeId, OwnerId, RunId, ThreadId};

/// Topic a client subscribes to. The router dispatches each published
/// [`Event`] to every client whose subscription set contains the matching
/// topic string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Thread(ThreadId),
    Agent(AgentId),
    WorkflowExecution(RunId),
    Ops,
}

impl Topic {
    pub fn as_string(&self) -> String {
        match self {
            Topic::Thread(id) => format!("thread:{id}"),
            Topic::Agent(id) => format!("agent:{id}"),
            Topic::WorkflowExecution(id) => format!("workflow_execution:{id}"),
            Topic::Ops => "ops:events".to_string(),
        }
    }
}

/// Event kinds published on the bus.
///
/// `AgentCreated`/`AgentDeleted`, `ThreadCreated`/`ThreadUpdated`/`ThreadDeleted`,
/// and `ThreadMessageCreated` are finer-grained aliases of `AgentUpdated` and
/// `NodeState`-style payloads: the live system's WebSocket schema
/// distinguishes these even though they share one underlying payload shape,
/// so both the coarse and fine kind are emitted for each transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunCreated { run_id: RunId, owner_id: OwnerId },
    RunUpdated { run_id: RunId, status: String },
    AgentUpdated { agent_id: AgentId },
    AgentCreated { agent_id: AgentId },
    AgentDeleted { agent_id: AgentId },
    ThreadCreated { thread_id: ThreadId, agent_id: AgentId },
    ThreadUpdated { thread_id: ThreadId },
    ThreadDeleted { thread_id: ThreadId },
    ThreadMessageCreated { thread_id: ThreadId, message_id: Uuid },
    TriggerFired { trigger_id: Uuid, payload: Value },
    NodeState {
        run_id: RunId,
        node_id: NodeId,
        phase: String,
        envelope: Option<Value>,
        error: Option<String>,
    },
    StreamStart { thread_id: ThreadId, assistant_message_id: Uuid },
    StreamChunk { thread_id: ThreadId, assistant_message_id: Uuid, delta: String },
    StreamEnd { thread_id: ThreadId, assistant_message_id: Uuid },
    AssistantId { thread_id: ThreadId, assistant_message_id: Uuid },
    /// Carries a provider-agnostic token/tool-loop notification, one level
    /// below the coarser kinds above, used by internal diagnostics and the
    /// `ops:events` topic.
    AgentEvent { agent_id: AgentId, detail: Value },
}

impl Event {
    /// The topics this event should be routed to. An event may target more
    /// than one topic (e.g. a thread message is visible on both the thread
    /// topic and, if the owning agent has observers, the agent topic).
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Event::RunCreated { .. } | Event::RunUpdated { .. } => vec![Topic::Ops],
            Event::AgentUpdated { agent_id }
            | Event::AgentCreated { agent_id }
            | Event::AgentDeleted { agent_id } => vec![Topic::Agent(*agent_id), Topic::Ops],
            Event::ThreadCreated { thread_id, agent_id } => {
                vec![Topic::Thread(*thread_id), Topic::Agent(*agent_id)]
            }
            Event::ThreadUpdated { thread_id }
            | Event::ThreadDeleted { thread_id }
            | Event::ThreadMessageCreated { thread_id, .. }
            | Event::StreamStart { thread_id, .. }
            | Event::StreamChunk { thread_id, .. }
            | Event::StreamEnd { thread_id, .. }
            | Event::AssistantId { thread_id, .. } => vec![Topic::Thread(*thread_id)],
            Event::TriggerFired { .. } => vec![Topic::Ops],
            Event::NodeState { run_id, .. } => vec![Topic::WorkflowExecution(*run_id)],
            Event::AgentEvent { agent_id, .. } => vec![Topic::Agent(*agent_id), Topic::Ops],
        }
    }

    fn kind_str(&self) -> &'static str {
        match self {
            Event::RunCreated { .. } => "run_created",
            Event::RunUpdated { .. } => "run_updated",
            Event::AgentUpdated { .. } => "agent_updated",
            Event::AgentCreated { .. } => "agent_created",
            Event::AgentDeleted { .. } => "agent_deleted",
            Event::ThreadCreated { .. } => "thread_created",
            Event::ThreadUpdated { .. } => "thread_updated",
            Event::ThreadDeleted { .. } => "thread_deleted",
            Event::ThreadMessageCreated { .. } => "thread_message_created",
            Event::TriggerFired { .. } => "trigger_fired",
            Event::NodeState { .. } => "node_state",
            Event::StreamStart { .. } => "stream_start",
            Event::StreamChunk { .. } => "stream_chunk",
            Event::StreamEnd { .. } => "stream_end",
            Event::AssistantId { .. } => "assistant_id",
            Event::AgentEvent { .. } => "agent_event",
        }
    }

    /// Wrap this event in the wire envelope a WebSocket client receives.
    pub fn into_envelope(self, topic: Topic) -> Envelope {
        let kind = self.kind_str().to_string();
        let data = serde_json::to_value(&self).unwrap_or(Value::Null);
        Envelope { v: 1, id: Uuid::new_v4(), kind, topic: Some(topic.as_string()), ts: Utc::now(), data }
    }
}

/// Wire format sent to WebSocket clients: `{v, id, type, topic, ts, data}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub data: Value,
}

const BUS_CAPACITY: usize = 4096;

/// In-process publish/subscribe bus. One `broadcast` channel backs every
/// subscriber; slow subscribers lag and drop old events rather than stall
/// publishers, consistent with the gateway's own back-pressure isolation at
/// the per-client mailbox layer in [`crate::zerg::ws`].
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is not an error; the event is simply dropped.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}
