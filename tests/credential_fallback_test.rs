//! End-to-end: a tool invocation resolves its connector credential through
//! the full `ToolRegistry` -> `ToolContext` -> `CredentialResolver` path,
//! preferring an agent-level override over the account-level credential, and
//! caching the result for the lifetime of the resolver.

use std::sync::Arc;

use async_trait::async_trait;
use fernet::Fernet;
use uuid::Uuid;

use zerg_core::zerg::credential::{CredentialCipher, CredentialResolver};
use zerg_core::zerg::domain::{AccountCredential, AgentCredentialOverride, CredentialTestStatus};
use zerg_core::zerg::store::{InMemoryStore, Store};
use zerg_core::zerg::tool_protocol::ToolMetadata;
use zerg_core::zerg::tool_registry::{ToolContext, ToolEnvelope, ToolInvoker, ToolRegistry};

struct GithubWhoAmI;

#[async_trait]
impl ToolInvoker for GithubWhoAmI {
    async fn invoke(&self, _args: serde_json::Value, ctx: &ToolContext) -> ToolEnvelope {
        match ctx.credentials.get("github").await {
            Ok(Some(credential)) => ToolEnvelope::success(serde_json::json!({"token": credential.plaintext})),
            Ok(None) => ToolEnvelope::error(
                zerg_core::zerg::tool_registry::ToolErrorType::ConnectorNotConfigured,
                "no github credential configured",
            ),
            Err(e) => ToolEnvelope::error(zerg_core::zerg::tool_registry::ToolErrorType::UpstreamError, e.to_string()),
        }
    }
}

fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ToolMetadata::new("github_whoami", "identify the authenticated github user"), Arc::new(GithubWhoAmI));
    registry
}

#[tokio::test]
async fn agent_override_wins_over_account_credential_for_the_owning_agent() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let cipher = Arc::new(CredentialCipher::new(&Fernet::generate_key()).unwrap());
    let owner_id = Uuid::new_v4();
    let overridden_agent = Uuid::new_v4();
    let plain_agent = Uuid::new_v4();

    store
        .upsert_account_credential(AccountCredential {
            owner_id,
            connector_type: "github".into(),
            encrypted_value: cipher.encrypt("account-token"),
            display_name: "GitHub (account)".into(),
            test_status: CredentialTestStatus::Untested,
            discovery_metadata: None,
        })
        .await
        .unwrap();
    store
        .upsert_agent_credential_override(AgentCredentialOverride {
            agent_id: overridden_agent,
            connector_type: "github".into(),
            encrypted_value: cipher.encrypt("override-token"),
            display_name: "GitHub (override)".into(),
            test_status: CredentialTestStatus::Untested,
        })
        .await
        .unwrap();

    let tools = registry();

    let override_resolver = Arc::new(CredentialResolver::new(Some(overridden_agent), owner_id, store.clone(), cipher.clone()));
    let override_ctx = ToolContext { owner_id, agent_id: Some(overridden_agent), credentials: override_resolver };
    let override_result = tools.invoke("github_whoami", &["github_*".to_string()], serde_json::json!({}), &override_ctx).await.unwrap();
    match override_result {
        ToolEnvelope::Success { data, .. } => assert_eq!(data["token"], serde_json::json!("override-token")),
        ToolEnvelope::Error { .. } => panic!("expected the override token"),
    }

    let fallback_resolver = Arc::new(CredentialResolver::new(Some(plain_agent), owner_id, store.clone(), cipher.clone()));
    let fallback_ctx = ToolContext { owner_id, agent_id: Some(plain_agent), credentials: fallback_resolver };
    let fallback_result = tools.invoke("github_whoami", &["github_*".to_string()], serde_json::json!({}), &fallback_ctx).await.unwrap();
    match fallback_result {
        ToolEnvelope::Success { data, .. } => assert_eq!(data["token"], serde_json::json!("account-token")),
        ToolEnvelope::Error { .. } => panic!("expected the account token"),
    }
}

#[tokio::test]
async fn resolution_is_cached_for_the_resolver_instance_even_after_the_store_changes() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let cipher = Arc::new(CredentialCipher::new(&Fernet::generate_key()).unwrap());
    let owner_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();

    store
        .upsert_account_credential(AccountCredential {
            owner_id,
            connector_type: "github".into(),
            encrypted_value: cipher.encrypt("first-token"),
            display_name: "GitHub".into(),
            test_status: CredentialTestStatus::Untested,
            discovery_metadata: None,
        })
        .await
        .unwrap();

    let resolver = Arc::new(CredentialResolver::new(Some(agent_id), owner_id, store.clone(), cipher.clone()));
    let tools = registry();
    let ctx = ToolContext { owner_id, agent_id: Some(agent_id), credentials: resolver.clone() };

    let first = tools.invoke("github_whoami", &["github_*".to_string()], serde_json::json!({}), &ctx).await.unwrap();
    assert!(matches!(first, ToolEnvelope::Success { .. }));

    store
        .upsert_account_credential(AccountCredential {
            owner_id,
            connector_type: "github".into(),
            encrypted_value: cipher.encrypt("second-token"),
            display_name: "GitHub".into(),
            test_status: CredentialTestStatus::Untested,
            discovery_metadata: None,
        })
        .await
        .unwrap();

    let second = tools.invoke("github_whoami", &["github_*".to_string()], serde_json::json!({}), &ctx).await.unwrap();
    match second {
        ToolEnvelope::Success { data, .. } => assert_eq!(data["token"], serde_json::json!("first-token")),
        ToolEnvelope::Error { .. } => panic!("expected the cached first token"),
    }
}
