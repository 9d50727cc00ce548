// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`ProviderFactory`] implementation binding vendor provider names to the
//! concrete [`AnthropicProvider`]/[`OpenAIProvider`] adapters, so
//! `llm-orchestrator-core`'s AI executor can construct a provider from
//! step-supplied credentials without linking against either vendor SDK
//! directly. `spec.md` §4.13, §6.

use std::sync::Arc;

use llm_orchestrator_core::executors::ai::ProviderFactory;
use llm_orchestrator_core::providers::{LLMProvider, ProviderError};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAIProvider;

/// Maps the `provider` field of an `ai` step's config (`"openai"`,
/// `"anthropic"`) to a constructed [`LLMProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(
        &self,
        provider: &str,
        api_key: &str,
        base_url: Option<&str>,
        api_version: Option<&str>,
    ) -> Result<Arc<dyn LLMProvider>, ProviderError> {
        match provider {
            "openai" => {
                let base_url = base_url.unwrap_or("https://api.openai.com/v1").to_string();
                Ok(Arc::new(OpenAIProvider::with_base_url(api_key.to_string(), base_url)))
            }
            "anthropic" => {
                let base_url = base_url.unwrap_or("https://api.anthropic.com/v1").to_string();
                let api_version = api_version.unwrap_or("2023-06-01").to_string();
                Ok(Arc::new(AnthropicProvider::with_base_url(api_key.to_string(), base_url, api_version)))
            }
            other => Err(ProviderError::InvalidRequest(format!("unknown LLM provider: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_openai_provider() {
        let factory = DefaultProviderFactory;
        let provider = factory.create("openai", "key", None, None).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn creates_anthropic_provider() {
        let factory = DefaultProviderFactory;
        let provider = factory.create("anthropic", "key", None, None).unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn rejects_unknown_provider() {
        let factory = DefaultProviderFactory;
        assert!(factory.create("bogus", "key", None, None).is_err());
    }
}
