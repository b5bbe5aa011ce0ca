//! Process-wide configuration, loaded from the environment.
//!
//! "Construct, don't parse a config file": no TOML/YAML crate is introduced,
//! `Settings` is just a struct with a `from_env()` constructor that reads
//! `std::env::var` and applies documented defaults.

use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Settings {
    pub jwt_secret: String,
    pub fernet_secret: String,
    pub app_public_url: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub pubsub_audience: Option<String>,
    pub trigger_signing_secret: String,
    pub max_output_tokens: usize,
    pub allowed_models_non_admin: HashSet<String>,
    pub daily_runs_per_user: u32,
    pub daily_cost_per_user_cents: u64,
    pub daily_cost_global_cents: u64,
    pub pricing_catalog_path: Option<PathBuf>,
    pub llm_token_stream: bool,
    pub allowed_cors_origins: Vec<String>,
    pub auth_disabled: bool,
}

impl Settings {
    /// Load settings from the process environment, applying the defaults a
    /// local/dev deployment needs so the crate is runnable without a `.env`.
    pub fn from_env() -> Self {
        Self {
            jwt_secret: env_or("JWT_SECRET", "dev-insecure-jwt-secret"),
            fernet_secret: env_or("FERNET_SECRET", &fernet::Fernet::generate_key()),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:8000"),
            google_client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            pubsub_audience: std::env::var("PUBSUB_AUDIENCE").ok(),
            trigger_signing_secret: env_or("TRIGGER_SIGNING_SECRET", "dev-insecure-trigger-secret"),
            max_output_tokens: env_parse("MAX_OUTPUT_TOKENS", 4096),
            allowed_models_non_admin: env_csv_set("ALLOWED_MODELS_NON_ADMIN"),
            daily_runs_per_user: env_parse("DAILY_RUNS_PER_USER", 200),
            daily_cost_per_user_cents: env_parse("DAILY_COST_PER_USER_CENTS", 500),
            daily_cost_global_cents: env_parse("DAILY_COST_GLOBAL_CENTS", 5_000),
            pricing_catalog_path: std::env::var("PRICING_CATALOG_PATH").ok().map(PathBuf::from),
            llm_token_stream: env_parse("LLM_TOKEN_STREAM", true),
            allowed_cors_origins: env_csv("ALLOWED_CORS_ORIGINS"),
            auth_disabled: env_parse("AUTH_DISABLED", false),
        }
    }

    /// `true` when every non-admin model restriction is empty, i.e. no allowlist is enforced.
    pub fn model_allowlist_enforced(&self) -> bool {
        !self.allowed_models_non_admin.is_empty()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn env_csv_set(key: &str) -> HashSet<String> {
    env_csv(key).into_iter().collect()
}
