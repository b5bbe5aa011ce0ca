//! Authenticated WebSocket gateway: one broadcast subscription fanned out to
//! many clients, each behind its own bounded outbound queue so a slow client
//! cannot stall delivery to the others.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::zerg::auth::{authenticate, AuthContext};
use crate::zerg::event::{Envelope, Event, EventBus};
use crate::zerg::settings::Settings;

use super::topics::Subscriptions;

const OUTBOUND_QUEUE_CAPACITY: usize = 500;
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

struct ClientHandle {
    sender: mpsc::Sender<Envelope>,
    subscriptions: Arc<Mutex<Subscriptions>>,
}

/// Owns the client registry and the single bus subscription that feeds it.
pub struct Gateway {
    event_bus: Arc<EventBus>,
    clients: Arc<RwLock<HashMap<Uuid, ClientHandle>>>,
}

impl Gateway {
    pub fn new(event_bus: Arc<EventBus>) -> Arc<Self> {
        let gateway = Arc::new(Self { event_bus, clients: Arc::new(RwLock::new(HashMap::new())) });
        gateway.clone().spawn_router();
        gateway
    }

    fn spawn_router(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut rx = self.event_bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(event) => self.dispatch(event).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Routes one event to every client subscribed to one of its topics.
    /// A full or closed outbound queue drops that client from the registry;
    /// its writer task then observes the channel close and ends the socket.
    async fn dispatch(&self, event: Event) {
        let topics = event.topics();
        let mut to_drop = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, handle) in clients.iter() {
                let matched = {
                    let subs = handle.subscriptions.lock().await;
                    topics.iter().find(|t| subs.contains(&t.as_string())).cloned()
                };
                let Some(topic) = matched else { continue };
                let envelope = event.clone().into_envelope(topic);
                if handle.sender.try_send(envelope).is_err() {
                    to_drop.push(*id);
                }
            }
        }
        if !to_drop.is_empty() {
            let mut clients = self.clients.write().await;
            for id in to_drop {
                clients.remove(&id);
            }
        }
    }

    async fn register(&self, subscriptions: Arc<Mutex<Subscriptions>>) -> (Uuid, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.clients.write().await.insert(id, ClientHandle { sender, subscriptions });
        (id, receiver)
    }

    async fn unregister(&self, id: Uuid) {
        self.clients.write().await.remove(&id);
    }
}

#[derive(Clone)]
pub struct WsAppState {
    pub gateway: Arc<Gateway>,
    pub settings: Arc<Settings>,
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
    Pong,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// `GET /ws`. Auth is checked before the protocol upgrade completes: a
/// rejected token never reaches [`WebSocketUpgrade::on_upgrade`], so the
/// client sees an HTTP 401 on the handshake itself rather than a frame-level
/// close, since there is no WS close code to send before the upgrade exists.
pub async fn ws_handler(
    State(state): State<WsAppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| bearer_token(&headers));
    match authenticate(token.as_deref(), &state.settings.jwt_secret, state.settings.auth_disabled) {
        Ok(ctx) => upgrade.on_upgrade(move |socket| handle_socket(socket, state, ctx)),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: WsAppState, _ctx: AuthContext) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let subscriptions = Arc::new(Mutex::new(Subscriptions::new()));
    let (client_id, mut outbound) = state.gateway.register(subscriptions.clone()).await;

    let mut writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut missed_pongs = 0u32;
        loop {
            tokio::select! {
                maybe_envelope = outbound.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    let Ok(text) = serde_json::to_string(&envelope) else { continue };
                    if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        let _ = ws_sender
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "heartbeat timeout".into(),
                            })))
                            .await;
                        break;
                    }
                    missed_pongs += 1;
                    if ws_sender.send(WsMessage::Text(ping_frame())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                WsMessage::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                        // Malformed payloads get one error frame then the
                        // connection is torn down; the writer task's own
                        // channel closing when we unregister ends the socket.
                        state
                            .gateway
                            .dispatch(Event::AgentEvent {
                                agent_id: Uuid::nil(),
                                detail: serde_json::json!({"code": "INVALID_PAYLOAD"}),
                            })
                            .await;
                        break;
                    };
                    match frame {
                        ClientFrame::Subscribe { topic } => subscriptions.lock().await.subscribe(topic),
                        ClientFrame::Unsubscribe { topic } => subscriptions.lock().await.unsubscribe(&topic),
                        ClientFrame::Ping | ClientFrame::Pong => {}
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
    }
    state.gateway.unregister(client_id).await;
}

fn ping_frame() -> String {
    serde_json::json!({"v": 1, "type": "ping"}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_subscribe_parses_topic() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"subscribe","topic":"ops:events"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { topic } if topic == "ops:events"));
    }

    #[test]
    fn malformed_client_frame_fails_to_parse() {
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[tokio::test]
    async fn gateway_drops_client_whose_queue_is_full() {
        let gateway = Gateway::new(Arc::new(EventBus::new()));
        let subs = Arc::new(Mutex::new(Subscriptions::new()));
        subs.lock().await.subscribe("ops:events".to_string());
        let (id, _receiver_kept_alive_but_never_drained) = gateway.register(subs).await;

        for _ in 0..(OUTBOUND_QUEUE_CAPACITY + 10) {
            gateway.dispatch(Event::AgentEvent { agent_id: Uuid::nil(), detail: serde_json::json!({}) }).await;
        }

        assert!(!gateway.clients.read().await.contains_key(&id));
    }

    #[tokio::test]
    async fn a_healthy_client_receives_every_event_in_order_while_a_stalled_one_is_dropped() {
        const EVENT_COUNT: usize = 1000;

        let gateway = Gateway::new(Arc::new(EventBus::new()));

        let stalled_subs = Arc::new(Mutex::new(Subscriptions::new()));
        stalled_subs.lock().await.subscribe("ops:events".to_string());
        let (stalled_id, _stalled_receiver_never_drained) = gateway.register(stalled_subs).await;

        let healthy_subs = Arc::new(Mutex::new(Subscriptions::new()));
        healthy_subs.lock().await.subscribe("ops:events".to_string());
        let (_healthy_id, mut healthy_receiver) = gateway.register(healthy_subs).await;

        let drain = tokio::spawn(async move {
            let mut received = Vec::with_capacity(EVENT_COUNT);
            while received.len() < EVENT_COUNT {
                let envelope = healthy_receiver.recv().await.expect("healthy client's queue closed early");
                received.push(envelope.data["detail"]["i"].as_u64().unwrap());
            }
            received
        });

        for i in 0..EVENT_COUNT {
            gateway
                .dispatch(Event::AgentEvent { agent_id: Uuid::nil(), detail: serde_json::json!({"i": i}) })
                .await;
        }

        let received = drain.await.unwrap();
        let expected: Vec<u64> = (0..EVENT_COUNT as u64).collect();
        assert_eq!(received, expected);

        assert!(!gateway.clients.read().await.contains_key(&stalled_id));
    }
}
