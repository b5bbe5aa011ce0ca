//! `POST /workflows`, `POST /workflows/{id}/execute`.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::zerg::auth::AuthContext;
use crate::zerg::client_registry::{build_client, connector_type_for_model};
use crate::zerg::client_wrapper::ClientWrapper;
use crate::zerg::credential::CredentialResolver;
use crate::zerg::domain::{Edge, Node, NodeConfig, Run, TriggerSource, Workflow};
use crate::zerg::error::ZergError;
use crate::zerg::tool_registry::ToolContext;
use crate::zerg::workflow::engine::{self, ExecutionDeps};
use crate::zerg::workflow::nodes::NodeExecCtx;

use super::AppState;

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

pub async fn create_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<Json<Workflow>, ZergError> {
    let workflow =
        Workflow { id: Uuid::new_v4(), owner_id: auth.owner_id, name: req.name, nodes: req.nodes, edges: req.edges };
    engine::compile(&workflow)?;
    state.store.upsert_workflow(workflow.clone()).await?;
    Ok(Json(workflow))
}

/// Resolves a provider client for every Agent node up front, since
/// [`NodeExecCtx::resolve_client`] must be synchronous: credential lookup is
/// async, so it cannot happen lazily inside the closure the engine calls
/// per node.
pub async fn execute_workflow(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<Run>, ZergError> {
    let workflow = state
        .store
        .load_workflow(workflow_id)
        .await?
        .ok_or_else(|| ZergError::validation("no such workflow"))?;
    if workflow.owner_id != auth.owner_id {
        return Err(ZergError::auth("workflow belongs to a different owner"));
    }

    let compiled = engine::compile(&workflow)?;
    let credentials = Arc::new(CredentialResolver::new(
        None,
        auth.owner_id,
        state.store.clone(),
        state.credential_cipher.clone(),
    ));

    let mut clients: HashMap<String, Arc<dyn ClientWrapper>> = HashMap::new();
    for node in &workflow.nodes {
        if let NodeConfig::Agent { agent_id, .. } = &node.config {
            let agent = state
                .store
                .load_agent(*agent_id)
                .await?
                .ok_or_else(|| ZergError::validation("unknown agent referenced by node"))?;
            let connector_type = connector_type_for_model(&agent.model)?;
            let credential = credentials
                .get(connector_type)
                .await?
                .ok_or_else(|| ZergError::validation(format!("no {connector_type} credential configured")))?;
            let client = build_client(&agent.model, &credential.plaintext)?;
            clients.insert(agent.model.clone(), client);
        }
    }

    let mut run = Run::queued(Uuid::new_v4(), auth.owner_id, TriggerSource::Api, chrono::Utc::now());
    run.workflow_id = Some(workflow.id);
    state.store.upsert_run(run.clone()).await?;

    let runner_deps = state.runner_deps();
    let tool_ctx = ToolContext { owner_id: auth.owner_id, agent_id: None, credentials: credentials.clone() };
    let trigger_payload = serde_json::json!({});
    let allowed_patterns: Vec<String> = vec!["*".to_string()];
    let store_for_agents = state.store.clone();
    let clients = Arc::new(clients);

    let load_agent = {
        let store = store_for_agents.clone();
        move |id: Uuid| -> Option<crate::zerg::domain::Agent> {
            futures::executor::block_on(store.load_agent(id)).ok().flatten()
        }
    };
    let resolve_client = {
        let clients = clients.clone();
        move |model: &str| -> Arc<dyn ClientWrapper> {
            clients
                .get(model)
                .cloned()
                .unwrap_or_else(|| panic!("no pre-resolved client for model {model}"))
        }
    };

    let node_ctx_factory = || NodeExecCtx {
        run_id: run.id,
        owner_id: auth.owner_id,
        trigger_payload: &trigger_payload,
        agent_runner_deps: &runner_deps,
        credentials: credentials.clone(),
        tool_ctx: &tool_ctx,
        tool_allowed_patterns: &allowed_patterns,
        load_agent: &load_agent,
        resolve_client: &resolve_client,
    };

    let deps = ExecutionDeps { store: state.store.as_ref(), event_bus: state.event_bus.as_ref(), node_ctx_factory: &node_ctx_factory };
    let cancel = engine::new_cancel_flag();
    let result = engine::execute(&compiled, &run, &deps, cancel.as_ref()).await?;

    let mut finished = run;
    finished.status = result.status;
    finished.finished_at = Some(chrono::Utc::now());
    state.store.upsert_run(finished.clone()).await?;
    Ok(Json(finished))
}
