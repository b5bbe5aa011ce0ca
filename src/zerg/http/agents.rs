//! `POST /agents`, `PATCH /agents/{id}`, `POST /agents/{id}/run`.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::zerg::auth::AuthContext;
use crate::zerg::client_registry::{build_client, connector_type_for_model};
use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{Agent, AgentStatus, Run, TriggerSource};
use crate::zerg::error::ZergError;
use crate::zerg::event::Event;
use crate::zerg::scheduler::{self, SchedulerDeps};

use super::AppState;

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub model: String,
    pub system_instructions: String,
    #[serde(default)]
    pub task_instructions: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub cron_schedule: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub model: Option<String>,
    pub system_instructions: Option<String>,
    pub task_instructions: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub cron_schedule: Option<Option<String>>,
}

pub async fn create_agent(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAgentRequest>,
) -> Result<Json<Agent>, ZergError> {
    state.quota.check_model_allowed(&req.model, auth.is_admin)?;
    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id: auth.owner_id,
        name: req.name,
        model: req.model,
        system_instructions: req.system_instructions,
        task_instructions: req.task_instructions,
        allowed_tools: req.allowed_tools,
        cron_schedule: req.cron_schedule,
        status: AgentStatus::Idle,
    };
    state.store.upsert_agent(agent.clone()).await?;
    state.event_bus.publish(Event::AgentCreated { agent_id: agent.id });
    Ok(Json(agent))
}

pub async fn update_agent(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(agent_id): Path<Uuid>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<Agent>, ZergError> {
    let mut agent = load_owned_agent(&state, &auth, agent_id).await?;

    if let Some(model) = req.model {
        state.quota.check_model_allowed(&model, auth.is_admin)?;
        agent.model = model;
    }
    if let Some(name) = req.name {
        agent.name = name;
    }
    if let Some(system_instructions) = req.system_instructions {
        agent.system_instructions = system_instructions;
    }
    if let Some(task_instructions) = req.task_instructions {
        agent.task_instructions = task_instructions;
    }
    if let Some(allowed_tools) = req.allowed_tools {
        agent.allowed_tools = allowed_tools;
    }
    if let Some(cron_schedule) = req.cron_schedule {
        agent.cron_schedule = cron_schedule;
    }

    state.store.upsert_agent(agent.clone()).await?;
    state.event_bus.publish(Event::AgentUpdated { agent_id: agent.id });
    Ok(Json(agent))
}

/// Resolves the agent's provider credential, dispatches through the
/// Scheduler's Task Runner path, and returns the resulting [`Run`]. A 409
/// surfaces automatically if the agent already has a run in flight, the
/// same [`crate::zerg::scheduler::lock::RunLock`] check every dispatch path shares.
pub async fn run_agent(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Run>, ZergError> {
    let agent = load_owned_agent(&state, &auth, agent_id).await?;

    let connector_type = connector_type_for_model(&agent.model)?;
    let credentials = CredentialResolver::new(
        Some(agent.id),
        auth.owner_id,
        state.store.clone(),
        state.credential_cipher.clone(),
    );
    let credential = credentials
        .get(connector_type)
        .await?
        .ok_or_else(|| ZergError::validation(format!("no {connector_type} credential configured")))?;
    let client = build_client(&agent.model, &credential.plaintext)?;

    let scheduler_deps = SchedulerDeps {
        runner_deps: state.runner_deps(),
        credential_cipher: state.credential_cipher.clone(),
        run_lock: state.run_lock.clone(),
        quota: state.quota.clone(),
    };
    let outcome =
        scheduler::run_scheduled_agent(&scheduler_deps, &agent, auth.is_admin, TriggerSource::Manual, client).await?;
    Ok(Json(outcome.run))
}

async fn load_owned_agent(state: &AppState, auth: &AuthContext, agent_id: Uuid) -> Result<Agent, ZergError> {
    let agent = state
        .store
        .load_agent(agent_id)
        .await?
        .ok_or_else(|| ZergError::validation("no such agent"))?;
    if agent.owner_id != auth.owner_id {
        return Err(ZergError::auth("agent belongs to a different owner"));
    }
    Ok(agent)
}
