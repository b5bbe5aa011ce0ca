//! Persistence seam.
//!
//! The ORM layer and migrations are out of scope, but the five subsystems
//! still need somewhere to durably read and write state in order to be
//! testable end-to-end. [`Store`] is that seam, an async trait so a real
//! database-backed adapter can slot in later without touching a caller.
//! [`InMemoryStore`] is the only implementation this crate ships, used both
//! as the runtime default and in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::zerg::domain::{
    AccountCredential, Agent, AgentCredentialOverride, AgentId, Connector, Message, NodeExecutionState,
    OwnerId, Run, RunId, Thread, ThreadId, Trigger, TriggerId, Workflow, WorkflowId,
};
use crate::zerg::error::ZergError;

/// Operations the Agent Runner, Workflow Engine, Trigger Ingress, and
/// Scheduler need against durable state. Object-safe so it can be held as
/// `Arc<dyn Store>` and shared across the async runtime.
#[async_trait]
pub trait Store: Send + Sync {
    async fn append_message(&self, message: Message) -> Result<(), ZergError>;
    async fn load_thread_messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, ZergError>;

    async fn upsert_agent(&self, agent: Agent) -> Result<(), ZergError>;
    async fn load_agent(&self, agent_id: AgentId) -> Result<Option<Agent>, ZergError>;
    async fn list_agents(&self, owner_id: OwnerId) -> Result<Vec<Agent>, ZergError>;
    async fn delete_agent(&self, agent_id: AgentId) -> Result<(), ZergError>;

    async fn upsert_thread(&self, thread: Thread) -> Result<(), ZergError>;
    async fn load_thread(&self, thread_id: ThreadId) -> Result<Option<Thread>, ZergError>;
    async fn list_threads(&self, agent_id: AgentId) -> Result<Vec<Thread>, ZergError>;

    async fn upsert_trigger(&self, trigger: Trigger) -> Result<(), ZergError>;
    async fn load_trigger(&self, trigger_id: TriggerId) -> Result<Option<Trigger>, ZergError>;
    async fn list_triggers(&self, agent_id: AgentId) -> Result<Vec<Trigger>, ZergError>;

    async fn upsert_connector(&self, connector: Connector) -> Result<(), ZergError>;
    async fn load_connector(
        &self,
        owner_id: OwnerId,
        connector_type: &str,
        provider: &str,
    ) -> Result<Option<Connector>, ZergError>;
    /// Looks up the Gmail connector whose `config.email_address` matches, used
    /// to resolve the owning Connector for an inbound Pub/Sub push.
    async fn find_connector_by_gmail_address(&self, email_address: &str) -> Result<Option<Connector>, ZergError>;
    /// All connectors of one type, across owners; the watch-renewal loop's scan.
    async fn list_connectors_by_type(&self, connector_type: &str) -> Result<Vec<Connector>, ZergError>;
    /// Every trigger an owner has defined, regardless of which agent it wakes.
    async fn list_triggers_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Trigger>, ZergError>;

    async fn upsert_workflow(&self, workflow: Workflow) -> Result<(), ZergError>;
    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, ZergError>;
    async fn list_workflows(&self, owner_id: OwnerId) -> Result<Vec<Workflow>, ZergError>;

    async fn upsert_run(&self, run: Run) -> Result<(), ZergError>;
    async fn load_run(&self, run_id: RunId) -> Result<Run, ZergError>;

    async fn record_node_state(&self, state: NodeExecutionState) -> Result<(), ZergError>;
    async fn load_node_states(&self, run_id: RunId) -> Result<Vec<NodeExecutionState>, ZergError>;

    /// Returns the last-seen dedupe cursor for a trigger (e.g. Gmail
    /// `history_id`, or the last processed webhook delivery id).
    async fn load_trigger_cursor(&self, trigger_id: TriggerId) -> Result<Option<String>, ZergError>;
    async fn store_trigger_cursor(&self, trigger_id: TriggerId, cursor: String) -> Result<(), ZergError>;

    async fn load_account_credential(
        &self,
        owner_id: OwnerId,
        connector_type: &str,
    ) -> Result<Option<AccountCredential>, ZergError>;
    async fn list_account_credentials(&self, owner_id: OwnerId) -> Result<Vec<AccountCredential>, ZergError>;
    async fn upsert_account_credential(&self, credential: AccountCredential) -> Result<(), ZergError>;
    async fn delete_account_credential(&self, owner_id: OwnerId, connector_type: &str) -> Result<(), ZergError>;

    async fn load_agent_credential_override(
        &self,
        agent_id: crate::zerg::domain::AgentId,
        connector_type: &str,
    ) -> Result<Option<AgentCredentialOverride>, ZergError>;
    async fn upsert_agent_credential_override(
        &self,
        credential: AgentCredentialOverride,
    ) -> Result<(), ZergError>;

    /// `daily_runs_per_user` quota counter, bumped on run dispatch.
    async fn increment_daily_run_count(&self, owner_id: OwnerId, day_key: &str) -> Result<u32, ZergError>;

    /// Daily cost accumulator in integer cents, bumped on run completion.
    async fn increment_daily_cost_cents(
        &self,
        owner_id: OwnerId,
        day_key: &str,
        delta_cents: u64,
    ) -> Result<u64, ZergError>;
}

#[derive(Default)]
struct StoreState {
    agents: HashMap<AgentId, Agent>,
    threads: HashMap<ThreadId, Thread>,
    triggers: HashMap<TriggerId, Trigger>,
    connectors: HashMap<(OwnerId, String, String), Connector>,
    workflows: HashMap<WorkflowId, Workflow>,
    messages: HashMap<ThreadId, Vec<Message>>,
    runs: HashMap<RunId, Run>,
    node_states: HashMap<RunId, Vec<NodeExecutionState>>,
    trigger_cursors: HashMap<TriggerId, String>,
    account_credentials: HashMap<(OwnerId, String), AccountCredential>,
    agent_credential_overrides: HashMap<(crate::zerg::domain::AgentId, String), AgentCredentialOverride>,
    daily_run_counts: HashMap<(OwnerId, String), u32>,
    daily_cost_cents: HashMap<(OwnerId, String), u64>,
}

/// Default `Store`, used when no external persistence adapter is wired in.
/// Data does not survive process restart; a real database-backed adapter is
/// expected to slot in behind the same trait for production deployments.
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(StoreState::default()) }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn append_message(&self, message: Message) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.messages.entry(message.thread_id).or_default().push(message);
        Ok(())
    }

    async fn load_thread_messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, ZergError> {
        let state = self.state.read().await;
        Ok(state.messages.get(&thread_id).cloned().unwrap_or_default())
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn load_agent(&self, agent_id: AgentId) -> Result<Option<Agent>, ZergError> {
        let state = self.state.read().await;
        Ok(state.agents.get(&agent_id).cloned())
    }

    async fn list_agents(&self, owner_id: OwnerId) -> Result<Vec<Agent>, ZergError> {
        let state = self.state.read().await;
        Ok(state.agents.values().filter(|a| a.owner_id == owner_id).cloned().collect())
    }

    async fn delete_agent(&self, agent_id: AgentId) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.agents.remove(&agent_id);
        Ok(())
    }

    async fn upsert_thread(&self, thread: Thread) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.threads.insert(thread.id, thread);
        Ok(())
    }

    async fn load_thread(&self, thread_id: ThreadId) -> Result<Option<Thread>, ZergError> {
        let state = self.state.read().await;
        Ok(state.threads.get(&thread_id).cloned())
    }

    async fn list_threads(&self, agent_id: AgentId) -> Result<Vec<Thread>, ZergError> {
        let state = self.state.read().await;
        Ok(state.threads.values().filter(|t| t.agent_id == agent_id).cloned().collect())
    }

    async fn upsert_trigger(&self, trigger: Trigger) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.triggers.insert(trigger.id, trigger);
        Ok(())
    }

    async fn load_trigger(&self, trigger_id: TriggerId) -> Result<Option<Trigger>, ZergError> {
        let state = self.state.read().await;
        Ok(state.triggers.get(&trigger_id).cloned())
    }

    async fn list_triggers(&self, agent_id: AgentId) -> Result<Vec<Trigger>, ZergError> {
        let state = self.state.read().await;
        Ok(state.triggers.values().filter(|t| t.agent_id == agent_id).cloned().collect())
    }

    async fn upsert_connector(&self, connector: Connector) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        let key = (connector.owner_id, connector.connector_type.clone(), connector.provider.clone());
        state.connectors.insert(key, connector);
        Ok(())
    }

    async fn load_connector(
        &self,
        owner_id: OwnerId,
        connector_type: &str,
        provider: &str,
    ) -> Result<Option<Connector>, ZergError> {
        let state = self.state.read().await;
        Ok(state.connectors.get(&(owner_id, connector_type.to_string(), provider.to_string())).cloned())
    }

    async fn find_connector_by_gmail_address(&self, email_address: &str) -> Result<Option<Connector>, ZergError> {
        let state = self.state.read().await;
        Ok(state
            .connectors
            .values()
            .find(|c| c.config.get("email_address").and_then(|v| v.as_str()) == Some(email_address))
            .cloned())
    }

    async fn list_connectors_by_type(&self, connector_type: &str) -> Result<Vec<Connector>, ZergError> {
        let state = self.state.read().await;
        Ok(state.connectors.values().filter(|c| c.connector_type == connector_type).cloned().collect())
    }

    async fn list_triggers_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Trigger>, ZergError> {
        let state = self.state.read().await;
        Ok(state.triggers.values().filter(|t| t.owner_id == owner_id).cloned().collect())
    }

    async fn upsert_workflow(&self, workflow: Workflow) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, ZergError> {
        let state = self.state.read().await;
        Ok(state.workflows.get(&workflow_id).cloned())
    }

    async fn list_workflows(&self, owner_id: OwnerId) -> Result<Vec<Workflow>, ZergError> {
        let state = self.state.read().await;
        Ok(state.workflows.values().filter(|w| w.owner_id == owner_id).cloned().collect())
    }

    async fn upsert_run(&self, run: Run) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.runs.insert(run.id, run);
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Run, ZergError> {
        let state = self.state.read().await;
        state
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| ZergError::validation(format!("no such run: {run_id}")))
    }

    async fn record_node_state(&self, node_state: NodeExecutionState) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        let entries = state.node_states.entry(node_state.run_id).or_default();
        if let Some(existing) = entries.iter_mut().find(|s| s.node_id == node_state.node_id) {
            *existing = node_state;
        } else {
            entries.push(node_state);
        }
        Ok(())
    }

    async fn load_node_states(&self, run_id: RunId) -> Result<Vec<NodeExecutionState>, ZergError> {
        let state = self.state.read().await;
        Ok(state.node_states.get(&run_id).cloned().unwrap_or_default())
    }

    async fn load_trigger_cursor(&self, trigger_id: TriggerId) -> Result<Option<String>, ZergError> {
        let state = self.state.read().await;
        Ok(state.trigger_cursors.get(&trigger_id).cloned())
    }

    async fn store_trigger_cursor(&self, trigger_id: TriggerId, cursor: String) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.trigger_cursors.insert(trigger_id, cursor);
        Ok(())
    }

    async fn load_account_credential(
        &self,
        owner_id: OwnerId,
        connector_type: &str,
    ) -> Result<Option<AccountCredential>, ZergError> {
        let state = self.state.read().await;
        Ok(state.account_credentials.get(&(owner_id, connector_type.to_string())).cloned())
    }

    async fn list_account_credentials(&self, owner_id: OwnerId) -> Result<Vec<AccountCredential>, ZergError> {
        let state = self.state.read().await;
        Ok(state.account_credentials.values().filter(|c| c.owner_id == owner_id).cloned().collect())
    }

    async fn upsert_account_credential(&self, credential: AccountCredential) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state
            .account_credentials
            .insert((credential.owner_id, credential.connector_type.clone()), credential);
        Ok(())
    }

    async fn delete_account_credential(&self, owner_id: OwnerId, connector_type: &str) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state.account_credentials.remove(&(owner_id, connector_type.to_string()));
        Ok(())
    }

    async fn load_agent_credential_override(
        &self,
        agent_id: crate::zerg::domain::AgentId,
        connector_type: &str,
    ) -> Result<Option<AgentCredentialOverride>, ZergError> {
        let state = self.state.read().await;
        Ok(state
            .agent_credential_overrides
            .get(&(agent_id, connector_type.to_string()))
            .cloned())
    }

    async fn upsert_agent_credential_override(
        &self,
        credential: AgentCredentialOverride,
    ) -> Result<(), ZergError> {
        let mut state = self.state.write().await;
        state
            .agent_credential_overrides
            .insert((credential.agent_id, credential.connector_type.clone()), credential);
        Ok(())
    }

    async fn increment_daily_run_count(&self, owner_id: OwnerId, day_key: &str) -> Result<u32, ZergError> {
        let mut state = self.state.write().await;
        let counter = state.daily_run_counts.entry((owner_id, day_key.to_string())).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn increment_daily_cost_cents(
        &self,
        owner_id: OwnerId,
        day_key: &str,
        delta_cents: u64,
    ) -> Result<u64, ZergError> {
        let mut state = self.state.write().await;
        let total = state.daily_cost_cents.entry((owner_id, day_key.to_string())).or_insert(0);
        *total += delta_cents;
        Ok(*total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::domain::{MessageRole, RunStatus, TriggerSource};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_message(thread_id: ThreadId) -> Message {
        Message {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::User,
            content: "hello".into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            sent_at: Utc::now(),
            parent_message_id: None,
        }
    }

    #[tokio::test]
    async fn appended_messages_preserve_order() {
        let store = InMemoryStore::new();
        let thread_id = Uuid::new_v4();
        store.append_message(sample_message(thread_id)).await.unwrap();
        store.append_message(sample_message(thread_id)).await.unwrap();

        let loaded = store.load_thread_messages(thread_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn load_run_errors_for_unknown_id() {
        let store = InMemoryStore::new();
        let err = store.load_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ZergError::Validation(_)));
    }

    #[tokio::test]
    async fn node_state_record_upserts_by_node_id() {
        let store = InMemoryStore::new();
        let run_id = Uuid::new_v4();
        let node_id = "n1".to_string();

        store
            .record_node_state(NodeExecutionState {
                run_id,
                node_id: node_id.clone(),
                phase: crate::zerg::domain::NodePhase::Running,
                output: None,
                error: None,
                started_at: Some(Utc::now()),
                finished_at: None,
            })
            .await
            .unwrap();
        store
            .record_node_state(NodeExecutionState {
                run_id,
                node_id: node_id.clone(),
                phase: crate::zerg::domain::NodePhase::Succeeded,
                output: None,
                error: None,
                started_at: Some(Utc::now()),
                finished_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        let states = store.load_node_states(run_id).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].phase, crate::zerg::domain::NodePhase::Succeeded);
    }

    #[tokio::test]
    async fn daily_run_count_increments_per_owner_and_day() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        assert_eq!(store.increment_daily_run_count(owner, "2026-07-26").await.unwrap(), 1);
        assert_eq!(store.increment_daily_run_count(owner, "2026-07-26").await.unwrap(), 2);
        assert_eq!(store.increment_daily_run_count(owner, "2026-07-27").await.unwrap(), 1);
    }

    #[test]
    fn run_queued_starts_untouched() {
        let owner = Uuid::new_v4();
        let run = Run::queued(Uuid::new_v4(), owner, TriggerSource::Manual, Utc::now());
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.finished_at.is_none());
    }
}
