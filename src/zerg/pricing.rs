//! Per-model pricing catalog.
//!
//! `total_cost_usd` is only ever computed from a provider-reported
//! [`TokenUsage`](crate::client_wrapper::TokenUsage) looked up against this
//! catalog, never estimated. `PRICING_CATALOG_PATH` (see
//! [`crate::zerg::settings::Settings`]) points at a JSON file; absent an
//! entry for a model, cost is left `None` rather than guessed.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::zerg::client_wrapper::TokenUsage;
use crate::zerg::error::ZergError;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ModelPrice {
    /// USD per 1,000 prompt tokens.
    pub input_per_1k: f64,
    /// USD per 1,000 completion tokens.
    pub output_per_1k: f64,
}

/// JSON-file-backed price list: `{"gpt-4o": {"input_per_1k": 0.0025, "output_per_1k": 0.01}, ...}`.
#[derive(Clone, Debug, Default)]
pub struct StaticPricingCatalog {
    prices: HashMap<String, ModelPrice>,
}

impl StaticPricingCatalog {
    pub fn empty() -> Self {
        Self { prices: HashMap::new() }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ZergError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ZergError::internal(format!("failed to read pricing catalog: {e}")))?;
        let prices: HashMap<String, ModelPrice> = serde_json::from_str(&contents)?;
        Ok(Self { prices })
    }

    /// Cost in USD, or `None` if the catalog has no entry for `model`.
    pub fn cost_usd(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        let price = self.prices.get(model)?;
        let input_cost = (usage.input_tokens as f64 / 1000.0) * price.input_per_1k;
        let output_cost = (usage.output_tokens as f64 / 1000.0) * price.output_per_1k;
        Some(input_cost + output_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_yields_no_cost() {
        let catalog = StaticPricingCatalog::empty();
        let usage = TokenUsage { input_tokens: 100, output_tokens: 50, total_tokens: 150 };
        assert_eq!(catalog.cost_usd("unknown-model", &usage), None);
    }

    #[test]
    fn known_model_computes_cost_from_reported_usage() {
        let mut prices = HashMap::new();
        prices.insert("gpt-4o".to_string(), ModelPrice { input_per_1k: 0.0025, output_per_1k: 0.01 });
        let catalog = StaticPricingCatalog { prices };
        let usage = TokenUsage { input_tokens: 1000, output_tokens: 1000, total_tokens: 2000 };
        let cost = catalog.cost_usd("gpt-4o", &usage).unwrap();
        assert!((cost - 0.0125).abs() < 1e-9);
    }
}
