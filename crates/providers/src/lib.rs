//! LLM provider implementations for Parley.
//!
//! All providers implement the `parley_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use parley_config::AppConfig;
use parley_core::error::ProviderError;
use parley_core::provider::Provider;
use std::sync::Arc;

/// Build the configured chat/embedding provider.
///
/// A missing API key is only accepted for local endpoints.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let is_local = config.api_url.contains("localhost") || config.api_url.contains("127.0.0.1");
    let api_key = match (&config.api_key, is_local) {
        (Some(key), _) => key.clone(),
        (None, true) => String::new(),
        (None, false) => {
            return Err(ProviderError::NotConfigured(
                "no API key; set PARLEY_API_KEY or OPENAI_API_KEY".into(),
            ));
        }
    };

    let name = if config.api_url.contains("api.openai.com") {
        "openai"
    } else {
        "openai_compat"
    };
    Ok(Arc::new(OpenAiCompatProvider::new(name, &config.api_url, api_key)?))
}
