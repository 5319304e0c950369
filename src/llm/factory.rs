use anyhow::{bail, Result};

use super::client::LlmClient;
use super::client::MockLlmClient;
use super::client_impl::{AnthropicClient, GeminiClient, OpenAIClient};
use crate::config::Config;

/// Create a generation backend client based on configuration
pub fn create_client(config: &Config, dry_run: bool) -> Result<Box<dyn LlmClient>> {
    if dry_run {
        return Ok(Box::new(MockLlmClient::new()));
    }

    let api_key = config.get_api_key()?;
    let llm = &config.llm;
    let max_tokens = llm.get_max_tokens();

    match llm.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicClient::new(
            api_key,
            llm.model.clone(),
            max_tokens,
            llm.timeout_secs,
        )?)),

        "openai" => {
            let client = match &llm.base_url {
                Some(base_url) => OpenAIClient::with_base_url(
                    api_key,
                    llm.model.clone(),
                    base_url.clone(),
                    max_tokens,
                    llm.timeout_secs,
                )?,
                None => OpenAIClient::new(api_key, llm.model.clone(), max_tokens, llm.timeout_secs)?,
            };
            Ok(Box::new(client.with_extra_body(llm.extra_body.clone())))
        }

        "openai-compatible" => {
            let base_url = llm
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string());

            Ok(Box::new(
                OpenAIClient::with_base_url(
                    api_key,
                    llm.model.clone(),
                    base_url,
                    max_tokens,
                    llm.timeout_secs,
                )?
                .with_extra_body(llm.extra_body.clone()),
            ))
        }

        "gemini" => Ok(Box::new(GeminiClient::new(
            api_key,
            llm.model.clone(),
            max_tokens,
            llm.timeout_secs,
        )?)),

        unknown => bail!("Unknown LLM provider: {}", unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_create_mock_client_for_dry_run() {
        let mut config = Config::default();
        config.llm.api_key_env = Some("REPOTEST_FACTORY_UNSET_KEY_1".to_string());
        // No key needed in dry-run mode
        create_client(&config, true).unwrap();
    }

    #[test]
    #[serial]
    fn test_create_each_provider() {
        env::set_var("REPOTEST_FACTORY_KEY", "test_key");
        for provider in ["openai", "anthropic", "gemini", "openai-compatible"] {
            let mut config = Config::default();
            config.llm.api_key_env = Some("REPOTEST_FACTORY_KEY".to_string());
            config.llm.provider = provider.to_string();
            assert!(create_client(&config, false).is_ok(), "provider {}", provider);
        }
        env::remove_var("REPOTEST_FACTORY_KEY");
    }

    #[test]
    #[serial]
    fn test_create_client_with_unknown_provider() {
        env::set_var("REPOTEST_FACTORY_KEY", "test_key");
        let mut config = Config::default();
        config.llm.api_key_env = Some("REPOTEST_FACTORY_KEY".to_string());
        config.llm.provider = "unknown_provider".to_string();
        let result = create_client(&config, false);
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Unknown LLM provider"));
        }
        env::remove_var("REPOTEST_FACTORY_KEY");
    }

    #[test]
    fn test_create_client_without_api_key() {
        let mut config = Config::default();
        config.llm.api_key_env = Some("REPOTEST_TEST_NONEXISTENT_KEY_FACTORY_99999".to_string());
        let result = create_client(&config, false);
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("API key not found"));
        }
    }
}
