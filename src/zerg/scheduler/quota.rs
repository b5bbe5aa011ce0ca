//! Quota gates: daily run/cost caps and the non-admin model allowlist.
//! Admins bypass every cap here.

use chrono::Utc;
use std::sync::Arc;

use crate::zerg::error::ZergError;
use crate::zerg::settings::Settings;
use crate::zerg::store::Store;

pub struct QuotaGate {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
}

fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl QuotaGate {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn Store>) -> Self {
        Self { settings, store }
    }

    /// `ALLOWED_MODELS_NON_ADMIN` check, applied at agent create/update time.
    pub fn check_model_allowed(&self, model: &str, is_admin: bool) -> Result<(), ZergError> {
        if is_admin || !self.settings.model_allowlist_enforced() {
            return Ok(());
        }
        if self.settings.allowed_models_non_admin.contains(model) {
            Ok(())
        } else {
            Err(ZergError::quota(format!("model {model} is not in the non-admin allowlist")))
        }
    }

    /// `DAILY_RUNS_PER_USER`, checked and recorded before a run is dispatched.
    pub async fn check_and_record_run(&self, owner_id: crate::zerg::domain::OwnerId, is_admin: bool) -> Result<(), ZergError> {
        let count = self.store.increment_daily_run_count(owner_id, &today_key()).await?;
        if !is_admin && count > self.settings.daily_runs_per_user {
            return Err(ZergError::quota("daily run cap reached for this user"));
        }
        Ok(())
    }

    /// `DAILY_COST_PER_USER_CENTS` / `DAILY_COST_GLOBAL_CENTS`: logs a warning
    /// at 80% of either cap, denies at 100%, unless `is_admin`. The global
    /// total is tracked under the nil UUID, a bucket no real owner can hit.
    pub async fn check_and_record_cost(
        &self,
        owner_id: crate::zerg::domain::OwnerId,
        delta_cents: u64,
        is_admin: bool,
    ) -> Result<(), ZergError> {
        let day = today_key();
        let user_total = self.store.increment_daily_cost_cents(owner_id, &day, delta_cents).await?;
        let global_total = self.store.increment_daily_cost_cents(uuid::Uuid::nil(), &day, delta_cents).await?;

        if is_admin {
            return Ok(());
        }

        warn_if_near_cap("per-user", user_total, self.settings.daily_cost_per_user_cents);
        warn_if_near_cap("global", global_total, self.settings.daily_cost_global_cents);

        if user_total > self.settings.daily_cost_per_user_cents {
            return Err(ZergError::quota("daily per-user cost cap reached"));
        }
        if global_total > self.settings.daily_cost_global_cents {
            return Err(ZergError::quota("daily global cost cap reached"));
        }
        Ok(())
    }
}

fn warn_if_near_cap(label: &str, total: u64, cap: u64) {
    if cap == 0 {
        return;
    }
    if total * 100 >= cap * 80 {
        log::warn!("{label} daily cost at {total} of {cap} cents (>= 80%)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zerg::store::InMemoryStore;
    use uuid::Uuid;

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
            allowed_models_non_admin: ["gpt-4o-mini".to_string()].into_iter().collect(),
            daily_runs_per_user: 2,
            daily_cost_per_user_cents: 100,
            daily_cost_global_cents: 1000,
            pricing_catalog_path: None,
            llm_token_stream: true,
            allowed_cors_origins: vec![],
            auth_disabled: false,
        })
    }

    #[test]
    fn disallowed_model_rejected_for_non_admin() {
        let gate = QuotaGate::new(settings(), Arc::new(InMemoryStore::new()));
        assert!(gate.check_model_allowed("gpt-5", false).is_err());
        assert!(gate.check_model_allowed("gpt-4o-mini", false).is_ok());
    }

    #[test]
    fn admin_bypasses_model_allowlist() {
        let gate = QuotaGate::new(settings(), Arc::new(InMemoryStore::new()));
        assert!(gate.check_model_allowed("anything", true).is_ok());
    }

    #[tokio::test]
    async fn daily_run_cap_denies_after_limit() {
        let gate = QuotaGate::new(settings(), Arc::new(InMemoryStore::new()));
        let owner = Uuid::new_v4();
        gate.check_and_record_run(owner, false).await.unwrap();
        gate.check_and_record_run(owner, false).await.unwrap();
        assert!(gate.check_and_record_run(owner, false).await.is_err());
    }

    #[tokio::test]
    async fn admin_bypasses_daily_run_cap() {
        let gate = QuotaGate::new(settings(), Arc::new(InMemoryStore::new()));
        let owner = Uuid::new_v4();
        for _ in 0..5 {
            gate.check_and_record_run(owner, true).await.unwrap();
        }
    }
}
