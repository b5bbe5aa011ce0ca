//! `GET /threads/{id}/messages`, `POST /threads/{id}/run`, `POST /threads/{id}/resume`.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::zerg::agent_runner::{self, RunnerOutcome};
use crate::zerg::auth::AuthContext;
use crate::zerg::client_registry::{build_client, connector_type_for_model};
use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{Agent, Message, MessageRole, Run, ThreadId, TriggerSource};
use crate::zerg::error::ZergError;
use crate::zerg::event::Event;

use super::AppState;

#[derive(Deserialize, Default)]
pub struct Pagination {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(thread_id): Path<ThreadId>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<Message>>, ZergError> {
    let thread = load_owned_thread(&state, &auth, thread_id).await?;
    let messages = state.store.load_thread_messages(thread.id).await?;
    let offset = page.offset.unwrap_or(0).min(messages.len());
    let limit = page.limit.unwrap_or(100);
    Ok(Json(messages.into_iter().skip(offset).take(limit).collect()))
}

#[derive(Deserialize)]
pub struct RunThreadRequest {
    pub content: String,
}

pub async fn run_thread(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(thread_id): Path<ThreadId>,
    Json(req): Json<RunThreadRequest>,
) -> Result<Json<Run>, ZergError> {
    let thread = load_owned_thread(&state, &auth, thread_id).await?;
    let message = Message {
        id: Uuid::new_v4(),
        thread_id: thread.id,
        role: MessageRole::User,
        content: req.content,
        tool_calls: None,
        tool_call_id: None,
        name: None,
        sent_at: Utc::now(),
        parent_message_id: None,
    };
    state.store.append_message(message.clone()).await?;
    state.event_bus.publish(Event::ThreadMessageCreated { thread_id: thread.id, message_id: message.id });

    let outcome = dispatch_turn(&state, &auth, thread.id, thread.agent_id, TriggerSource::Api).await?;
    Ok(Json(outcome.run))
}

/// Resumes an interrupted thread: no new user content, same turn dispatch.
pub async fn resume_thread(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(thread_id): Path<ThreadId>,
) -> Result<Json<Run>, ZergError> {
    let thread = load_owned_thread(&state, &auth, thread_id).await?;
    let outcome = dispatch_turn(&state, &auth, thread.id, thread.agent_id, TriggerSource::Api).await?;
    Ok(Json(outcome.run))
}

async fn dispatch_turn(
    state: &AppState,
    auth: &AuthContext,
    thread_id: ThreadId,
    agent_id: Uuid,
    trigger_source: TriggerSource,
) -> Result<RunnerOutcome, ZergError> {
    let agent: Agent = state
        .store
        .load_agent(agent_id)
        .await?
        .ok_or_else(|| ZergError::validation("thread's agent no longer exists"))?;

    state.run_lock.acquire(agent.id).await?;
    let result = run_turn_locked(state, auth, &agent, thread_id, trigger_source).await;
    state.run_lock.release(agent.id).await;
    result
}

async fn run_turn_locked(
    state: &AppState,
    auth: &AuthContext,
    agent: &Agent,
    thread_id: ThreadId,
    trigger_source: TriggerSource,
) -> Result<RunnerOutcome, ZergError> {
    state.quota.check_and_record_run(auth.owner_id, auth.is_admin).await?;

    let connector_type = connector_type_for_model(&agent.model)?;
    let credentials = Arc::new(CredentialResolver::new(
        Some(agent.id),
        auth.owner_id,
        state.store.clone(),
        state.credential_cipher.clone(),
    ));
    let credential = credentials
        .get(connector_type)
        .await?
        .ok_or_else(|| ZergError::validation(format!("no {connector_type} credential configured")))?;
    let client = build_client(&agent.model, &credential.plaintext)?;

    let run = Run::queued(Uuid::new_v4(), auth.owner_id, trigger_source, Utc::now());
    let runner_deps = state.runner_deps();
    let outcome =
        agent_runner::run_turn(&runner_deps, agent, thread_id, client, credentials, serde_json::json!({}), run)
            .await?;

    if let Some(cost_usd) = outcome.run.total_cost_usd {
        let cents = (cost_usd * 100.0).round().max(0.0) as u64;
        let _ = state.quota.check_and_record_cost(auth.owner_id, cents, auth.is_admin).await;
    }
    Ok(outcome)
}

async fn load_owned_thread(
    state: &AppState,
    auth: &AuthContext,
    thread_id: ThreadId,
) -> Result<crate::zerg::domain::Thread, ZergError> {
    let thread = state
        .store
        .load_thread(thread_id)
        .await?
        .ok_or_else(|| ZergError::validation("no such thread"))?;
    if thread.owner_id != auth.owner_id {
        return Err(ZergError::auth("thread belongs to a different owner"));
    }
    Ok(thread)
}
