//! Authenticated WebSocket fan-out: envelope v1, topic subscriptions,
//! heartbeat, and per-client back-pressure isolation.

pub mod gateway;
pub mod topics;

pub use gateway::{ws_handler, Gateway, WsAppState};
