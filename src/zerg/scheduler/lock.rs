//! Per-agent run exclusion.
//!
//! A single-in-flight-session-per-conversation state machine generalized from
//! one conversation key to `agent_id`.

use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::zerg::domain::AgentId;
use crate::zerg::error::ZergError;

/// Tracks which agents currently have a run in flight. Acquired before
/// dispatch, released explicitly on the run's terminal transition, not an
/// RAII guard, since release happens from wherever the run actually finishes
/// (possibly a different task than the one that acquired it).
#[derive(Default)]
pub struct RunLock {
    held: Mutex<HashSet<AgentId>>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors with [`ZergError::conflict`] if `agent_id` already has a run in flight.
    pub async fn acquire(&self, agent_id: AgentId) -> Result<(), ZergError> {
        let mut held = self.held.lock().await;
        if !held.insert(agent_id) {
            return Err(ZergError::conflict(format!("agent {agent_id} already has a run in progress")));
        }
        Ok(())
    }

    pub async fn release(&self, agent_id: AgentId) {
        let mut held = self.held.lock().await;
        held.remove(&agent_id);
    }

    pub async fn is_held(&self, agent_id: AgentId) -> bool {
        self.held.lock().await.contains(&agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn second_acquire_for_same_agent_conflicts() {
        let lock = RunLock::new();
        let agent_id = Uuid::new_v4();
        lock.acquire(agent_id).await.unwrap();
        assert!(lock.acquire(agent_id).await.is_err());
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let lock = RunLock::new();
        let agent_id = Uuid::new_v4();
        lock.acquire(agent_id).await.unwrap();
        lock.release(agent_id).await;
        assert!(lock.acquire(agent_id).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_agents_do_not_conflict() {
        let lock = RunLock::new();
        lock.acquire(Uuid::new_v4()).await.unwrap();
        assert!(lock.acquire(Uuid::new_v4()).await.is_ok());
    }
}
