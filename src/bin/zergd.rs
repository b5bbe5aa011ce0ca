//! `zergd`: the Zerg execution core's HTTP + WebSocket server binary.
//!
//! Wires the in-memory store, event bus, tool registry and quota/lock gates
//! into the [`zerg_core::zerg::http`] router and serves it alongside the
//! [`zerg_core::zerg::ws`] gateway on a single listener.

use std::sync::Arc;

use zerg_core::zerg::credential::CredentialCipher;
use zerg_core::zerg::event::EventBus;
use zerg_core::zerg::http::{self, AppState};
use zerg_core::zerg::pricing::StaticPricingCatalog;
use zerg_core::zerg::scheduler::lock::RunLock;
use zerg_core::zerg::scheduler::quota::QuotaGate;
use zerg_core::zerg::settings::Settings;
use zerg_core::zerg::store::InMemoryStore;
use zerg_core::zerg::tool_registry::ToolRegistry;
use zerg_core::zerg::ws::Gateway;

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = Arc::new(Settings::from_env());
    let store = Arc::new(InMemoryStore::new());
    let event_bus = Arc::new(EventBus::new());
    let tool_registry = Arc::new(ToolRegistry::new());
    let pricing = Arc::new(match &settings.pricing_catalog_path {
        Some(path) => StaticPricingCatalog::from_json_file(path).unwrap_or_else(|e| {
            log::warn!("failed to load pricing catalog at {}: {e}", path.display());
            StaticPricingCatalog::empty()
        }),
        None => StaticPricingCatalog::empty(),
    });
    let credential_cipher = Arc::new(
        CredentialCipher::new(&settings.fernet_secret).expect("FERNET_SECRET must be a valid fernet key"),
    );
    let run_lock = Arc::new(RunLock::new());
    let quota = Arc::new(QuotaGate::new(settings.clone(), store.clone()));

    let state = AppState {
        store,
        event_bus: event_bus.clone(),
        tool_registry,
        pricing,
        credential_cipher,
        run_lock,
        quota,
        settings: settings.clone(),
    };
    let gateway = Gateway::new(event_bus);

    let app = http::router(state, gateway);

    let addr = format!("0.0.0.0:{}", std::env::var("PORT").unwrap_or_else(|_| "8000".to_string()));
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind listener");
    log::info!("zergd listening on {addr}");
    axum::serve(listener, app).await.expect("server error");
}
