//! HTTP API: owner-scoped agent/thread/trigger/connector/workflow CRUD plus
//! dispatch endpoints, assembled on top of the same [`Store`]/[`EventBus`]
//! the scheduler and triggers ingress share.

pub mod agents;
pub mod connectors;
pub mod metrics;
pub mod threads;
pub mod triggers;
pub mod workflows;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::zerg::agent_runner::AgentRunnerDeps;
use crate::zerg::auth::{self, AuthContext};
use crate::zerg::credential::CredentialCipher;
use crate::zerg::error::ZergError;
use crate::zerg::event::EventBus;
use crate::zerg::pricing::StaticPricingCatalog;
use crate::zerg::scheduler::lock::RunLock;
use crate::zerg::scheduler::quota::QuotaGate;
use crate::zerg::settings::Settings;
use crate::zerg::store::Store;
use crate::zerg::tool_registry::ToolRegistry;
use crate::zerg::triggers::ingress::IngressState;
use crate::zerg::triggers::{self, GmailPubsubState};
use crate::zerg::ws;

/// Everything every HTTP handler needs; cheap to clone, every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub event_bus: Arc<EventBus>,
    pub tool_registry: Arc<ToolRegistry>,
    pub pricing: Arc<StaticPricingCatalog>,
    pub credential_cipher: Arc<CredentialCipher>,
    pub run_lock: Arc<RunLock>,
    pub quota: Arc<QuotaGate>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn runner_deps(&self) -> AgentRunnerDeps {
        AgentRunnerDeps {
            store: self.store.clone(),
            event_bus: self.event_bus.clone(),
            tool_registry: self.tool_registry.clone(),
            pricing: self.pricing.clone(),
        }
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ZergError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts);
        auth::authenticate(token.as_deref(), &state.settings.jwt_secret, state.settings.auth_disabled)
    }
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.allowed_cors_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<_> = settings
        .allowed_cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
}

/// Assembles the full API surface, including the unauthenticated ingress
/// endpoints (they authenticate via their own signature/OIDC checks rather
/// than the bearer-token [`AuthContext`] extractor) and the WebSocket gateway.
pub fn router(state: AppState, gateway: Arc<ws::Gateway>) -> Router {
    let api = Router::new()
        .route("/agents", post(agents::create_agent))
        .route("/agents/{id}", patch(agents::update_agent))
        .route("/agents/{id}/run", post(agents::run_agent))
        .route("/threads/{id}/messages", get(threads::list_messages))
        .route("/threads/{id}/run", post(threads::run_thread))
        .route("/threads/{id}/resume", post(threads::resume_thread))
        .route("/triggers", post(triggers::create_trigger))
        .route("/account/connectors", get(connectors::list_connectors).post(connectors::create_connector))
        .route("/account/connectors/{type}", delete(connectors::delete_connector))
        .route("/workflows", post(workflows::create_workflow))
        .route("/workflows/{id}/execute", post(workflows::execute_workflow))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state.clone());

    let ingress = Router::new()
        .route("/triggers/{id}/events", post(triggers::ingress::webhook_handler))
        .with_state(Arc::new(IngressState { store: state.store.clone(), event_bus: state.event_bus.clone() }));

    let gmail = Router::new()
        .route("/email/webhook/google/pubsub", post(triggers::gmail::pubsub_handler))
        .with_state(Arc::new(GmailPubsubState {
            store: state.store.clone(),
            event_bus: state.event_bus.clone(),
            pubsub_audience: state.settings.pubsub_audience.clone().unwrap_or_default(),
        }));

    let ws_router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(ws::WsAppState { gateway, settings: state.settings.clone() });

    Router::new()
        .merge(api)
        .merge(ingress)
        .merge(gmail)
        .merge(ws_router)
        .layer(cors_layer(&state.settings))
        .layer(TraceLayer::new_for_http())
}
