//! `POST /triggers`. Webhook/Gmail event ingestion itself lives in
//! [`crate::zerg::triggers`]; this only covers trigger definition CRUD.

use axum::extract::State;
use axum::Json;
use rand::RngCore;
use serde::Deserialize;
use uuid::Uuid;

use crate::zerg::auth::AuthContext;
use crate::zerg::domain::{Trigger, TriggerType};
use crate::zerg::error::ZergError;

use super::AppState;

#[derive(Deserialize)]
pub struct CreateTriggerRequest {
    pub agent_id: Uuid,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn create_trigger(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateTriggerRequest>,
) -> Result<Json<Trigger>, ZergError> {
    let agent = state
        .store
        .load_agent(req.agent_id)
        .await?
        .ok_or_else(|| ZergError::validation("no such agent"))?;
    if agent.owner_id != auth.owner_id {
        return Err(ZergError::auth("agent belongs to a different owner"));
    }

    let trigger = Trigger {
        id: Uuid::new_v4(),
        owner_id: auth.owner_id,
        agent_id: agent.id,
        trigger_type: req.trigger_type,
        secret: random_secret(),
        config: req.config,
    };
    state.store.upsert_trigger(trigger.clone()).await?;
    Ok(Json(trigger))
}
