//! Cron scheduling, the Task Runner, per-agent run exclusion, and quota gates.

pub mod cron;
pub mod lock;
pub mod quota;

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::zerg::agent_runner::{self, AgentRunnerDeps, RunnerOutcome};
use crate::zerg::client_wrapper::ClientWrapper;
use crate::zerg::credential::{CredentialCipher, CredentialResolver};
use crate::zerg::domain::{Agent, Message, MessageRole, Run, Thread, ThreadId, ThreadKind, TriggerSource};
use crate::zerg::error::ZergError;
use crate::zerg::store::Store;

use lock::RunLock;
use quota::QuotaGate;

pub struct SchedulerDeps {
    pub runner_deps: AgentRunnerDeps,
    pub credential_cipher: Arc<CredentialCipher>,
    pub run_lock: Arc<RunLock>,
    pub quota: Arc<QuotaGate>,
}

/// Non-interactive run dispatch: fresh Thread, persisted system + task
/// instructions messages, per-agent exclusion, quota gates, delegation to the
/// Agent Runner. Drives the same path the "Run" button and trigger-initiated
/// runs use.
pub async fn run_scheduled_agent(
    deps: &SchedulerDeps,
    agent: &Agent,
    is_admin: bool,
    trigger_source: TriggerSource,
    client: Arc<dyn ClientWrapper>,
) -> Result<RunnerOutcome, ZergError> {
    deps.run_lock.acquire(agent.id).await?;
    let result = dispatch(deps, agent, is_admin, trigger_source, client).await;
    deps.run_lock.release(agent.id).await;
    result
}

async fn dispatch(
    deps: &SchedulerDeps,
    agent: &Agent,
    is_admin: bool,
    trigger_source: TriggerSource,
    client: Arc<dyn ClientWrapper>,
) -> Result<RunnerOutcome, ZergError> {
    deps.quota.check_and_record_run(agent.owner_id, is_admin).await?;
    deps.quota.check_and_record_cost(agent.owner_id, 0, is_admin).await?;

    let thread_id: ThreadId = Uuid::new_v4();
    let kind = if trigger_source == TriggerSource::Schedule { ThreadKind::Scheduled } else { ThreadKind::Manual };
    let thread = Thread {
        id: thread_id,
        owner_id: agent.owner_id,
        agent_id: agent.id,
        title: format!("{} run", agent.name),
        kind,
        agent_state: serde_json::json!({}),
        memory_strategy: "default".into(),
    };
    deps.runner_deps.store.upsert_thread(thread).await?;

    let now = Utc::now();
    deps.runner_deps
        .store
        .append_message(Message {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::System,
            content: agent.system_instructions.clone(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            sent_at: now,
            parent_message_id: None,
        })
        .await?;
    deps.runner_deps
        .store
        .append_message(Message {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::User,
            content: agent.task_instructions.clone(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            sent_at: now,
            parent_message_id: None,
        })
        .await?;

    let credentials = Arc::new(CredentialResolver::new(
        Some(agent.id),
        agent.owner_id,
        deps.runner_deps.store.clone(),
        deps.credential_cipher.clone(),
    ));

    let mut run = Run::queued(Uuid::new_v4(), agent.owner_id, trigger_source, now);
    run.agent_id = Some(agent.id);
    run.thread_id = Some(thread_id);

    let outcome =
        agent_runner::run_turn(&deps.runner_deps, agent, thread_id, client, credentials, serde_json::json!({}), run)
            .await?;

    if let Some(cost_usd) = outcome.run.total_cost_usd {
        let cents = (cost_usd * 100.0).round().max(0.0) as u64;
        let _ = deps.quota.check_and_record_cost(agent.owner_id, cents, is_admin).await;
    }

    Ok(outcome)
}

/// `true` if a Thread's `agent_state.wake_condition` is a due time-based wake.
pub fn is_time_wake_due(agent_state: &serde_json::Value, now: chrono::DateTime<Utc>) -> bool {
    let Some(wake) = agent_state.get("wake_condition") else { return false };
    if wake.get("type").and_then(|t| t.as_str()) != Some("time") {
        return false;
    }
    wake.get("at")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc) <= now)
        .unwrap_or(false)
}

/// Scans the given agents' threads for due time-based wakes. A real
/// deployment calls this periodically over every owner's agents; which
/// agents to scan is a caller concern, not this function's.
pub async fn scan_due_time_wakes(
    store: &dyn Store,
    agents: &[Agent],
    now: chrono::DateTime<Utc>,
) -> Result<Vec<ThreadId>, ZergError> {
    let mut due = Vec::new();
    for agent in agents {
        for thread in store.list_threads(agent.id).await? {
            if is_time_wake_due(&thread.agent_state, now) {
                due.push(thread.id);
            }
        }
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_wake_due_when_at_is_in_the_past() {
        let state = serde_json::json!({"wake_condition": {"type": "time", "at": "2020-01-01T00:00:00Z"}});
        assert!(is_time_wake_due(&state, Utc::now()));
    }

    #[test]
    fn time_wake_not_due_when_at_is_in_the_future() {
        let future = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        let state = serde_json::json!({"wake_condition": {"type": "time", "at": future}});
        assert!(!is_time_wake_due(&state, Utc::now()));
    }

    #[test]
    fn non_time_wake_condition_is_never_due() {
        let state = serde_json::json!({"wake_condition": {"type": "email"}});
        assert!(!is_time_wake_due(&state, Utc::now()));
    }
}
