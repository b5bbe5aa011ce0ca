// src/lib.rs

//! `zerg-core`, the execution core of the Zerg agent-orchestration backend.
//!
//! This crate owns the five subsystems that guarantee "what the user drew is
//! what runs": the [`zerg::workflow`] engine, the [`zerg::agent_runner`]
//! ReAct driver, the [`zerg::triggers`] ingress + [`zerg::scheduler`], the
//! [`zerg::event`] bus and [`zerg::ws`] fan-out gateway, and
//! [`zerg::credential`] resolution. The chat/dashboard UI, database
//! migrations, and connector-specific API bindings are out of scope and are
//! named only where they cross this crate's boundary.

pub mod zerg;

// Re-export the handful of types most callers reach for first.
pub use zerg::client_wrapper::{ClientWrapper, Message, Role};
pub use zerg::domain::{Agent, Owner, Run, Thread, Trigger, Workflow};
pub use zerg::error::ZergError;
pub use zerg::event::{Event, EventBus};
pub use zerg::settings::Settings;
