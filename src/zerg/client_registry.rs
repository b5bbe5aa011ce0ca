//! Maps an agent's model identifier to a concrete [`ClientWrapper`] and the
//! connector type whose credential backs it.
//!
//! Grounded in `clients/{claude,openai,gemini,grok}.rs`'s
//! `new_with_model_str`/`new_with_model_string` constructors; this module
//! adds the model-prefix dispatch those constructors leave to their callers.

use std::sync::Arc;

use crate::zerg::client_wrapper::ClientWrapper;
use crate::zerg::clients::claude::ClaudeClient;
use crate::zerg::clients::gemini::GeminiClient;
use crate::zerg::clients::grok::GrokClient;
use crate::zerg::clients::openai::OpenAIClient;
use crate::zerg::error::ZergError;

/// The connector type whose credential supplies the API key for `model`.
pub fn connector_type_for_model(model: &str) -> Result<&'static str, ZergError> {
    if model.starts_with("claude-") {
        Ok("anthropic")
    } else if model.starts_with("gpt-") || model.starts_with("o1") || model.starts_with("o3") {
        Ok("openai")
    } else if model.starts_with("gemini-") {
        Ok("google")
    } else if model.starts_with("grok-") {
        Ok("xai")
    } else {
        Err(ZergError::validation(format!("unrecognized model identifier: {model}")))
    }
}

/// Builds the provider wrapper for `model`, authenticated with `api_key`.
pub fn build_client(model: &str, api_key: &str) -> Result<Arc<dyn ClientWrapper>, ZergError> {
    let client: Arc<dyn ClientWrapper> = match connector_type_for_model(model)? {
        "anthropic" => Arc::new(ClaudeClient::new_with_model_str(api_key, model)),
        "openai" => Arc::new(OpenAIClient::new_with_model_string(api_key, model)),
        "google" => Arc::new(GeminiClient::new_with_model_string(api_key, model)),
        "xai" => Arc::new(GrokClient::new_with_model_str(api_key, model)),
        _ => unreachable!("connector_type_for_model only returns the branches matched above"),
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_each_provider_prefix() {
        assert_eq!(connector_type_for_model("claude-3-5-sonnet").unwrap(), "anthropic");
        assert_eq!(connector_type_for_model("gpt-4o").unwrap(), "openai");
        assert_eq!(connector_type_for_model("gemini-1.5-pro").unwrap(), "google");
        assert_eq!(connector_type_for_model("grok-2").unwrap(), "xai");
    }

    #[test]
    fn unrecognized_model_is_rejected() {
        assert!(connector_type_for_model("llama-3").is_err());
    }
}
