//! Background Gmail handling: the `history.list` pass a notification triggers
//! once it clears dedupe, and the periodic watch-renewal loop.
//!
//! The actual Gmail REST calls (`history.list`, `users.watch`, refresh-token
//! exchange) are a connector-specific binding this crate names only;
//! `GmailApi` is that named boundary. Everything this module owns is the
//! retry/backoff policy, the dedupe-before-dispatch ordering, and
//! per-trigger filter evaluation around it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::zerg::domain::{Connector, TriggerType};
use crate::zerg::error::ZergError;
use crate::zerg::event::{Event, EventBus};
use crate::zerg::store::Store;

use super::gmail::{matches_filters, GmailMessageMetadata};

const WATCH_RENEWAL_THRESHOLD: Duration = Duration::hours(24);
const MAX_BACKOFF_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: StdDuration = StdDuration::from_millis(250);

/// The Gmail-specific operations this crate treats as an external capability.
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// Messages new since `connector.config.history_id`, each tagged with the
    /// history id it was observed at (so the caller can advance the cursor
    /// to the maximum actually processed, not just the notification's own).
    async fn list_new_messages(&self, connector: &Connector) -> Result<Vec<(u64, GmailMessageMetadata)>, ZergError>;

    /// Re-issues `users.watch`, returning the new expiry.
    async fn renew_watch(&self, connector: &Connector) -> Result<DateTime<Utc>, ZergError>;
}

async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, ZergError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ZergError>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < MAX_BACKOFF_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
                log::warn!("gmail background op failed (attempt {attempt}): {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs once a Pub/Sub notification has cleared dedupe and updated
/// `last_msg_no`: lists history since the connector's cursor, evaluates
/// every owner's Email trigger's filters against each new message, and
/// publishes `TriggerFired` for matches. Advances `history_id` to the
/// highest observed value regardless of whether anything matched.
pub async fn process_notification(
    api: &dyn GmailApi,
    store: &dyn Store,
    event_bus: &EventBus,
    mut connector: Connector,
) -> Result<(), ZergError> {
    let messages = with_backoff(|| api.list_new_messages(&connector)).await?;
    if messages.is_empty() {
        return Ok(());
    }

    let triggers: Vec<_> = store
        .list_triggers_by_owner(connector.owner_id)
        .await?
        .into_iter()
        .filter(|t| t.trigger_type == TriggerType::Email)
        .collect();

    let mut max_history_id = connector.config.get("history_id").and_then(|v| v.as_u64()).unwrap_or(0);
    for (history_id, message) in &messages {
        max_history_id = max_history_id.max(*history_id);
        for trigger in &triggers {
            if matches_filters(&trigger.config, message) {
                event_bus.publish(Event::TriggerFired {
                    trigger_id: trigger.id,
                    payload: serde_json::json!({
                        "from": message.from,
                        "subject": message.subject,
                        "snippet": message.snippet,
                        "labels": message.labels,
                    }),
                });
            }
        }
    }

    if let serde_json::Value::Object(map) = &mut connector.config {
        map.insert("history_id".to_string(), serde_json::json!(max_history_id));
    }
    store.upsert_connector(connector).await
}

/// Background loop: every `period`, scan Gmail connectors approaching their
/// 7-day watch expiry and renew them. Runs until the process exits; meant to
/// be spawned once at startup.
pub async fn run_watch_renewal_loop(store: Arc<dyn Store>, api: Arc<dyn GmailApi>, period: StdDuration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = renew_expiring_watches(store.as_ref(), api.as_ref()).await {
            log::error!("gmail watch renewal pass failed: {e}");
        }
    }
}

async fn renew_expiring_watches(store: &dyn Store, api: &dyn GmailApi) -> Result<(), ZergError> {
    let now = Utc::now();
    for connector in store.list_connectors_by_type("gmail").await? {
        let Some(expiry) = connector.config.get("watch_expiry").and_then(|v| v.as_str()) else {
            continue;
        };
        let Ok(expiry) = DateTime::parse_from_rfc3339(expiry) else { continue };
        if expiry.with_timezone(&Utc) - now > WATCH_RENEWAL_THRESHOLD {
            continue;
        }

        let mut updated = connector.clone();
        match with_backoff(|| api.renew_watch(&connector)).await {
            Ok(new_expiry) => {
                if let serde_json::Value::Object(map) = &mut updated.config {
                    map.insert("watch_expiry".to_string(), serde_json::json!(new_expiry.to_rfc3339()));
                }
                store.upsert_connector(updated).await?;
            }
            Err(e) => log::error!("watch renewal exhausted retries for {}: {e}", connector.owner_id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyApi {
        failures_remaining: AtomicUsize,
    }

    #[async_trait]
    impl GmailApi for FlakyApi {
        async fn list_new_messages(&self, _connector: &Connector) -> Result<Vec<(u64, GmailMessageMetadata)>, ZergError> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(ZergError::upstream("transient gmail error"));
            }
            Ok(vec![(
                43,
                GmailMessageMetadata { from: "boss@co.com".into(), subject: "urgent".into(), snippet: String::new(), labels: vec![] },
            )])
        }

        async fn renew_watch(&self, _connector: &Connector) -> Result<DateTime<Utc>, ZergError> {
            Ok(Utc::now() + Duration::days(7))
        }
    }

    fn test_connector(owner_id: uuid::Uuid) -> Connector {
        Connector {
            owner_id,
            connector_type: "gmail".into(),
            provider: "google".into(),
            encrypted_credential: vec![],
            config: serde_json::json!({"email_address": "a@example.com", "history_id": 10}),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let api = FlakyApi { failures_remaining: AtomicUsize::new(2) };
        let owner_id = uuid::Uuid::new_v4();
        let store = Arc::new(crate::zerg::store::InMemoryStore::new());
        let event_bus = EventBus::new();
        let connector = test_connector(owner_id);

        process_notification(&api, store.as_ref(), &event_bus, connector).await.unwrap();

        let updated = store.list_connectors_by_type("gmail").await.unwrap();
        assert_eq!(updated[0].config.get("history_id").and_then(|v| v.as_u64()), Some(43));
    }

    #[tokio::test]
    async fn permanent_failure_surfaces_after_max_attempts() {
        let api = FlakyApi { failures_remaining: AtomicUsize::new(999) };
        let owner_id = uuid::Uuid::new_v4();
        let store = Arc::new(crate::zerg::store::InMemoryStore::new());
        let event_bus = EventBus::new();
        let connector = test_connector(owner_id);

        let result = process_notification(&api, store.as_ref(), &event_bus, connector).await;
        assert!(result.is_err());
    }
}
