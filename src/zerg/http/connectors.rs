//! `GET/POST /account/connectors`, `DELETE /account/connectors/{type}`.
//!
//! Despite the URL, these operate on [`AccountCredential`] (owner-scoped
//! secrets for built-in tools); the `Connector` domain type is Gmail-style
//! OAuth/webhook state, a different entity, per the data model.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::zerg::auth::AuthContext;
use crate::zerg::domain::{AccountCredential, CredentialTestStatus};
use crate::zerg::error::ZergError;

use super::AppState;

#[derive(Serialize)]
pub struct RedactedCredential {
    pub connector_type: String,
    pub display_name: String,
    pub test_status: CredentialTestStatus,
    pub discovery_metadata: Option<serde_json::Value>,
}

impl From<AccountCredential> for RedactedCredential {
    fn from(c: AccountCredential) -> Self {
        Self {
            connector_type: c.connector_type,
            display_name: c.display_name,
            test_status: c.test_status,
            discovery_metadata: c.discovery_metadata,
        }
    }
}

pub async fn list_connectors(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<RedactedCredential>>, ZergError> {
    let credentials = state.store.list_account_credentials(auth.owner_id).await?;
    Ok(Json(credentials.into_iter().map(RedactedCredential::from).collect()))
}

#[derive(Deserialize)]
pub struct CreateConnectorRequest {
    pub connector_type: String,
    pub display_name: String,
    pub value: String,
}

pub async fn create_connector(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateConnectorRequest>,
) -> Result<Json<RedactedCredential>, ZergError> {
    let credential = AccountCredential {
        owner_id: auth.owner_id,
        connector_type: req.connector_type,
        encrypted_value: state.credential_cipher.encrypt(&req.value),
        display_name: req.display_name,
        test_status: CredentialTestStatus::Untested,
        discovery_metadata: None,
    };
    state.store.upsert_account_credential(credential.clone()).await?;
    Ok(Json(credential.into()))
}

pub async fn delete_connector(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(connector_type): Path<String>,
) -> Result<(), ZergError> {
    state.store.delete_account_credential(auth.owner_id, &connector_type).await
}
