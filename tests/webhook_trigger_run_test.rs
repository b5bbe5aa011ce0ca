//! End-to-end: webhook delivery carrying a valid HMAC signature fires a
//! trigger and, once dispatched through the scheduler, produces one
//! successful Run with a Thread whose first message is the agent's task
//! instructions.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::Utc;
use uuid::Uuid;

use zerg_core::zerg::agent_runner::AgentRunnerDeps;
use zerg_core::zerg::client_wrapper::{ClientWrapper, Message as WireMessage, Role as WireRole, TokenUsage, ToolDefinition};
use zerg_core::zerg::credential::CredentialCipher;
use zerg_core::zerg::domain::{Agent, AgentStatus, MessageRole, TriggerSource, TriggerType};
use zerg_core::zerg::event::{Event, EventBus};
use zerg_core::zerg::pricing::StaticPricingCatalog;
use zerg_core::zerg::scheduler::lock::RunLock;
use zerg_core::zerg::scheduler::quota::QuotaGate;
use zerg_core::zerg::scheduler::{run_scheduled_agent, SchedulerDeps};
use zerg_core::zerg::settings::Settings;
use zerg_core::zerg::store::{InMemoryStore, Store};
use zerg_core::zerg::tool_registry::ToolRegistry;
use zerg_core::zerg::triggers::ingress::{verify_webhook_signature, WebhookVerificationError};

struct MockClientWrapper {
    reply: StdMutex<Option<String>>,
}

#[async_trait]
impl ClientWrapper for MockClientWrapper {
    async fn send_message(
        &self,
        _messages: &[WireMessage],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<WireMessage, Box<dyn std::error::Error>> {
        let reply = self.reply.lock().unwrap().take().unwrap_or_else(|| "ok".to_string());
        Ok(WireMessage { role: WireRole::Assistant, content: reply.into(), tool_calls: vec![] })
    }

    fn model_name(&self) -> &str {
        "gpt-4o-mini"
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        Some(TokenUsage { input_tokens: 12, output_tokens: 4, total_tokens: 16 })
    }
}

fn settings() -> Arc<Settings> {
    Arc::new(Settings {
        jwt_secret: "s".into(),
        fernet_secret: fernet::Fernet::generate_key(),
        app_public_url: "http://localhost".into(),
        google_client_id: None,
        google_client_secret: None,
        pubsub_audience: None,
        trigger_signing_secret: "s".into(),
        max_output_tokens: 4096,
        allowed_models_non_admin: Default::default(),
        daily_runs_per_user: 200,
        daily_cost_per_user_cents: 5_000,
        daily_cost_global_cents: 50_000,
        pricing_catalog_path: None,
        llm_token_stream: true,
        allowed_cors_origins: vec![],
        auth_disabled: false,
    })
}

fn hmac_hex(secret: &str, signed_payload: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(signed_payload);
    mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

#[tokio::test]
async fn webhook_then_dispatch_yields_one_successful_run() {
    let owner_id = Uuid::new_v4();
    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id,
        name: "responder".into(),
        model: "gpt-4o-mini".into(),
        system_instructions: "Be helpful.".into(),
        task_instructions: "Summarize the ping payload.".into(),
        allowed_tools: vec![],
        cron_schedule: None,
        status: AgentStatus::Idle,
    };

    let secret = "trigger-secret";
    let trigger = zerg_core::zerg::domain::Trigger {
        id: Uuid::new_v4(),
        owner_id,
        agent_id: agent.id,
        trigger_type: TriggerType::Webhook,
        secret: secret.to_string(),
        config: serde_json::json!({}),
    };

    let body = br#"{"ping":1}"#;
    let now = Utc::now();
    let ts = now.timestamp().to_string();
    let mut signed_payload = format!("{ts}.").into_bytes();
    signed_payload.extend_from_slice(body);
    let sig = hmac_hex(secret, &signed_payload);

    assert!(verify_webhook_signature(&trigger.secret, &ts, &sig, body, now).is_ok());

    // Simulate the actual HTTP handler's verification path directly.
    let mut headers = HeaderMap::new();
    headers.insert("X-Zerg-Timestamp", HeaderValue::from_str(&ts).unwrap());
    headers.insert("X-Zerg-Signature", HeaderValue::from_str(&sig).unwrap());

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    store.upsert_agent(agent.clone()).await.unwrap();
    store.upsert_trigger(trigger.clone()).await.unwrap();

    let event_bus = Arc::new(EventBus::new());
    let ingress_state = Arc::new(zerg_core::zerg::triggers::ingress::IngressState {
        store: store.clone(),
        event_bus: event_bus.clone(),
    });

    let mut ops_rx = event_bus.subscribe();

    let status = zerg_core::zerg::triggers::ingress::webhook_handler(
        State(ingress_state),
        Path(trigger.id),
        headers,
        Bytes::from_static(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let fired = ops_rx.recv().await.unwrap();
    assert!(matches!(fired, Event::TriggerFired { trigger_id, .. } if trigger_id == trigger.id));

    // The scheduler drives the actual agent dispatch once a trigger fires.
    let runner_deps = AgentRunnerDeps {
        store: store.clone(),
        event_bus: event_bus.clone(),
        tool_registry: Arc::new(ToolRegistry::new()),
        pricing: Arc::new(StaticPricingCatalog::empty()),
    };
    let scheduler_deps = SchedulerDeps {
        runner_deps,
        credential_cipher: Arc::new(CredentialCipher::new(&fernet::Fernet::generate_key()).unwrap()),
        run_lock: Arc::new(RunLock::new()),
        quota: Arc::new(QuotaGate::new(settings(), store.clone())),
    };
    let client: Arc<dyn ClientWrapper> = Arc::new(MockClientWrapper { reply: StdMutex::new(Some("ok".into())) });

    let outcome =
        run_scheduled_agent(&scheduler_deps, &agent, false, TriggerSource::Webhook, client).await.unwrap();

    assert_eq!(outcome.run.status, zerg_core::zerg::domain::RunStatus::Success);
    assert_eq!(outcome.run.trigger_source, TriggerSource::Webhook);

    let thread_id = outcome.run.thread_id.unwrap();
    let messages = store.load_thread_messages(thread_id).await.unwrap();
    assert!(messages.iter().any(|m| m.role == MessageRole::User && m.content == agent.task_instructions));

    let run_created = ops_rx.recv().await.unwrap();
    assert!(matches!(run_created, Event::RunCreated { .. }));
    let run_updated = ops_rx.recv().await.unwrap();
    assert!(matches!(run_updated, Event::RunUpdated { status, .. } if status == "Success"));
}

#[test]
fn missing_or_mismatched_signature_never_verifies() {
    let secret = "trigger-secret";
    let now = Utc::now();
    let ts = now.timestamp().to_string();
    let body = b"{}";

    let err = verify_webhook_signature(secret, &ts, "deadbeef", body, now).unwrap_err();
    assert_eq!(err, WebhookVerificationError::SignatureMismatch);
}
