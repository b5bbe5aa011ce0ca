//! `GET /metrics`: hand-formatted Prometheus text exposition. No metrics
//! crate is introduced; the counts come straight off the quota ledger
//! [`Store`](crate::zerg::store::Store) already keeps.

use axum::extract::State;
use chrono::Utc;

use super::AppState;
use crate::zerg::error::ZergError;

fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, ZergError> {
    let day = today_key();
    let global_cost_cents =
        state.store.increment_daily_cost_cents(uuid::Uuid::nil(), &day, 0).await.unwrap_or(0);

    let mut out = String::new();
    out.push_str("# HELP zerg_daily_cost_cents_total Daily accumulated run cost in integer cents.\n");
    out.push_str("# TYPE zerg_daily_cost_cents_total gauge\n");
    out.push_str(&format!("zerg_daily_cost_cents_total{{day=\"{day}\"}} {global_cost_cents}\n"));
    Ok(out)
}
